use std::collections::HashSet;

/// Which upstream users may register files.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    allowed: HashSet<String>,
}

impl AccessPolicy {
    /// An empty list admits every user.
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed
                .into_iter()
                .map(Into::into)
                .map(|user: String| user.trim().to_string())
                .filter(|user| !user.is_empty())
                .collect(),
        }
    }

    pub fn is_allowed(&self, user: &str) -> bool {
        self.allowed.is_empty() || self.allowed.contains(user)
    }
}
