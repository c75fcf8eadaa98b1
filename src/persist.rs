//! JSON state files that survive restarts.
//!
//! All persistent service state outside the sqlite store (registry, task
//! ledger, profile list) is kept as plain JSON documents that are re-read
//! at startup.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Read a JSON state file, or produce the default value if it does not
/// exist yet.
pub fn load_or_default<T>(path: &Path) -> Result<T, std::io::Error>
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        return Ok(T::default());
    }

    let buffer = std::fs::read(path)?;
    serde_json::from_slice(&buffer).map_err(std::io::Error::other)
}

/// Write a JSON state file in place.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), std::io::Error> {
    let buffer = serde_json::to_vec(value).map_err(std::io::Error::other)?;
    std::fs::write(path, buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct State {
        counter: u32,
    }

    #[test]
    fn missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let state: State = load_or_default(&dir.path().join("state.json")).unwrap();
        assert_eq!(state, State::default());
    }

    #[test]
    fn round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        save_json(&path, &State { counter: 7 }).unwrap();
        let state: State = load_or_default(&path).unwrap();
        assert_eq!(state.counter, 7);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let result: Result<State, _> = load_or_default(&path);
        assert!(result.is_err());
    }
}
