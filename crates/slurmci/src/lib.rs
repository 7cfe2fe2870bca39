pub mod common;
pub mod github;
pub mod server;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::SlurmCiError;
pub type Result<T> = std::result::Result<T, Error>;

pub type Map<K, V> = hashbrown::HashMap<K, V>;
pub type Set<T> = hashbrown::HashSet<T>;

pub const SLURMCI_VERSION: &str = {
    match option_env!("SLURMCI_BUILD_VERSION") {
        Some(version) => version,
        None => env!("CARGO_PKG_VERSION"),
    }
};
