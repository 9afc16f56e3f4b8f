/// Number of logical databases a namespace index may select.
pub const NAMESPACE_COUNT: u8 = 16;

/// Partitions the shared key space between unrelated applications.
///
/// Every caller key is prefixed before it reaches the store, and the index
/// selects a logical database on stores that support them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
    index: u8,
}

impl Namespace {
    /// Creates a namespace from an explicit prefix and, optionally, an
    /// explicit index. Without an index one is derived from the prefix.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below [`NAMESPACE_COUNT`].
    #[must_use]
    pub fn new(prefix: impl Into<String>, index: Option<u8>) -> Self {
        let prefix = prefix.into();
        let index = index.map_or_else(|| hash_index(&prefix), |index| {
            assert!(
                index < NAMESPACE_COUNT,
                "namespace index must be below {NAMESPACE_COUNT}"
            );
            index
        });

        Self { prefix, index }
    }

    /// Creates a namespace from an explicit prefix with a derived index.
    #[must_use]
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self::new(prefix, None)
    }

    /// Derives prefix and index from an identifier that is stable per
    /// deployment, such as an application name.
    ///
    /// Non-word characters become `_` and the prefix ends with `:`, so
    /// `billing/api` yields `billing_api:`.
    #[must_use]
    pub fn derive(identifier: &str) -> Self {
        let mut prefix: String = identifier
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        prefix.push(':');

        Self::with_prefix(prefix)
    }

    /// The key prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The logical database index, always below [`NAMESPACE_COUNT`].
    #[must_use]
    pub const fn index(&self) -> u8 {
        self.index
    }

    /// Prefixes a caller key.
    #[must_use]
    pub fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    /// Recovers the caller key from a prefixed key.
    #[must_use]
    pub fn strip<'a>(&self, prefixed: &'a str) -> &'a str {
        prefixed.strip_prefix(&self.prefix).unwrap_or(prefixed)
    }
}

// First hex digit of the MD5 digest of the prefix.
fn hash_index(prefix: &str) -> u8 {
    md5::compute(prefix.as_bytes()).0[0] >> 4
}
