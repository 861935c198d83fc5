//! Backend endpoint paths
//!
//! Paths are relative to the configured API base URL.

/// Versioned API prefix shared by every backend route
pub const API_PREFIX: &str = "/api/v1";

/// Mints a new access credential from the ambient refresh cookie
pub const REFRESH_PATH: &str = "/api/v1/auth/token/refresh";

/// Invalidates the server-side session
pub const LOGOUT_PATH: &str = "/api/v1/auth/logout";

/// Cookie carrying the long-lived session credential when none is configured
pub const DEFAULT_REFRESH_COOKIE: &str = "refresh_token";

pub const LOCATIONS_PATH: &str = "/api/v1/locations";
pub const GROUPS_PATH: &str = "/api/v1/groups";
pub const CATEGORIES_PATH: &str = "/api/v1/categories";
