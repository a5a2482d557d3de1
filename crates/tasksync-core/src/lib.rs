//! Task lists over pluggable backends, with an offline cache and background
//! sync for remote ones.

pub mod app;
pub mod background;
pub mod backend;
pub mod backends;
pub mod cache;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod credentials;
pub mod error;
pub mod model;
pub mod registry;
pub mod selector;
pub mod sync;

#[cfg(test)]
mod test_env;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::version;

    #[test]
    fn version_is_not_empty() {
        assert!(!version().is_empty());
    }
}
