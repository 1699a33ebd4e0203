use rand::Rng;

/// Expected database schema version
/// All databases must use this version for compatibility
pub const EXPECTED_DB_VERSION: &str = "1";

/// Length of join tokens and device credentials
pub const TOKEN_LENGTH: usize = 32;

/// Generate a random alphanumeric secret with the given prefix
/// Used for join tokens ("jt_") and device credentials ("dc_")
pub fn generate_secret(prefix: &str) -> String {
    format!(
        "{}_{}",
        prefix,
        rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(TOKEN_LENGTH)
            .map(char::from)
            .collect::<String>()
    )
}
