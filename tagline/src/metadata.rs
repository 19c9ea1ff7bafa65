//! Ordered call metadata (headers and trailers).

use bytes::Bytes;

/// Ordered multimap of metadata entries.
///
/// Entries keep insertion order and a key may appear more than once, matching
/// what goes out on the wire. Lookups return the first match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataMap {
    entries: Vec<(String, Bytes)>,
}

impl MetadataMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            entries: Vec::with_capacity(n),
        }
    }

    /// Append an entry. Existing entries with the same key are kept.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.entries.push((key.into(), value.into()));
    }

    /// First value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_ref())
    }

    /// First value under `key`, if it is valid UTF-8.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Every value stored under `key`, in insertion order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check every key, returning the first invalid one.
    pub fn validate(&self) -> Result<(), &str> {
        match self.keys().find(|k| !is_valid_key(k)) {
            Some(bad) => Err(bad),
            None => Ok(()),
        }
    }
}

/// Keys are non-empty lowercase ASCII drawn from `[a-z0-9-_.]`. Pseudo-headers
/// (leading `:`) belong to the transport and are rejected.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.bytes().all(|b| {
            b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'-' | b'_' | b'.')
        })
}

impl<K, V> FromIterator<(K, V)> for MetadataMap
where
    K: Into<String>,
    V: Into<Bytes>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl IntoIterator for MetadataMap {
    type Item = (String, Bytes);
    type IntoIter = std::vec::IntoIter<(String, Bytes)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_insertion_order() {
        let md: MetadataMap = [("hello", "world"), ("foo", "bar")].into_iter().collect();
        let keys: Vec<&str> = md.keys().collect();
        assert_eq!(keys, ["hello", "foo"]);
        assert_eq!(md.get_str("hello"), Some("world"));
        assert_eq!(md.get("foo"), Some(&b"bar"[..]));
    }

    #[test]
    fn repeated_keys() {
        let mut md = MetadataMap::new();
        md.insert("x-trace", "a");
        md.insert("other", "z");
        md.insert("x-trace", "b");
        assert_eq!(md.len(), 3);
        assert_eq!(md.get("x-trace"), Some(&b"a"[..]));
        let all: Vec<&[u8]> = md.get_all("x-trace").collect();
        assert_eq!(all, [&b"a"[..], &b"b"[..]]);
    }

    #[test]
    fn key_validation() {
        assert!(is_valid_key("content-type"));
        assert!(is_valid_key("x_custom.v2"));
        assert!(!is_valid_key(""));
        assert!(!is_valid_key("Upper"));
        assert!(!is_valid_key(":path"));
        assert!(!is_valid_key("with space"));

        let mut md = MetadataMap::new();
        md.insert("good", "1");
        assert!(md.validate().is_ok());
        md.insert("Bad", "2");
        assert_eq!(md.validate(), Err("Bad"));
    }

    #[test]
    fn binary_values() {
        let mut md = MetadataMap::new();
        md.insert("blob-bin", vec![0u8, 159, 146, 150]);
        assert_eq!(md.get("blob-bin"), Some(&[0u8, 159, 146, 150][..]));
        assert_eq!(md.get_str("blob-bin"), None);
    }
}
