#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

#[cfg(not(target_arch = "wasm32"))]
use uuid::Uuid;

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(js_namespace = ["self", "crypto"])]
    fn randomUUID() -> String;
}

pub fn get_uuid() -> String {
    #[cfg(target_arch = "wasm32")]
    {
        randomUUID()
    }

    #[cfg(not(target_arch = "wasm32"))]
    {
        Uuid::new_v4().to_string()
    }
}

/// Random 64-bit id used to correlate a submitted event with the response
/// pending on the client that submitted it. Random, not guaranteed unique;
/// collision odds within the lifetime of a pending-response table are accepted.
pub fn fresh_correlation_id() -> u64 {
    let uuid = get_uuid();
    let hex: String = uuid
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .take(16)
        .collect();
    u64::from_str_radix(&hex, 16).expect("a uuid contains at least 16 hex digits")
}

/// Short random suffix, e.g. for making article slugs unique.
pub fn short_id() -> String {
    get_uuid().chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_uuid() {
        let uuid1 = get_uuid();
        let uuid2 = get_uuid();

        assert_ne!(uuid1, uuid2);
        assert_eq!(uuid1.len(), 36);
        assert!(uuid1.chars().filter(|&c| c == '-').count() == 4);
    }

    #[test]
    fn test_fresh_correlation_id() {
        let id1 = fresh_correlation_id();
        let id2 = fresh_correlation_id();

        assert_ne!(id1, id2);
    }

    #[test]
    fn test_short_id() {
        let id = short_id();

        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() || c == '-'));
    }
}
