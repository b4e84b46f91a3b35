//! Centralized default values for gateway configuration.
//!
//! Every tunable that `GatewayConfig::from_env()` reads has its default
//! declared here so the binary, tests and documentation agree on one value.

/// Session cookie carrying the logged-in username.
pub const DEFAULT_SESSION_COOKIE: &str = "username";

/// Header set by the edge network carrying the originating client address.
pub const DEFAULT_IDENTITY_HEADER: &str = "cf-connecting-ip";

/// Public URL users are redirected to after an OAuth-style login.
pub const DEFAULT_SHARE_URL: &str = "https://example.com";

/// Lifetime of the session cookie issued by the login flows, in days.
pub const DEFAULT_COOKIE_MAX_AGE_DAYS: u64 = 7;

/// Upper bound on the 429 body collected for quota bookkeeping (64 KiB).
///
/// Rate-limit envelopes are a few hundred bytes; anything larger is relayed
/// but not parsed.
pub const DEFAULT_RATE_LIMIT_BODY_MAX: usize = 64 * 1024;

/// Seconds in one day, used to turn the cookie lifetime into `Max-Age`.
pub const SECONDS_PER_DAY: u64 = 86_400;
