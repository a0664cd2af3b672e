//! Test fixture utilities.

use edb_protocol::{Address, ClientConfiguration, ResolvedConnectConfig, TlsSecurity};

/// Port used by fixtures.
pub const TEST_PORT: u16 = 5656;

/// Address of the pretend server.
#[must_use]
pub fn test_address() -> Address {
    Address::tcp("127.0.0.1", TEST_PORT)
}

/// Resolved parameters pointing at the pretend server.
#[must_use]
pub fn test_params() -> ResolvedConnectConfig {
    ResolvedConnectConfig {
        address: test_address(),
        user: "edgedb".into(),
        password: None,
        database: "edgedb".into(),
        tls_security: TlsSecurity::Insecure,
    }
}

/// Client configuration used by fixtures.
#[must_use]
pub fn test_config() -> ClientConfiguration {
    ClientConfiguration::default()
}
