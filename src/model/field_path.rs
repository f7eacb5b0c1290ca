use std::collections::BTreeSet;

use crate::error::{invalid_argument, SyncResult};

/// A dot-separated path into a document's fields.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn new<S, I>(segments: I) -> SyncResult<Self>
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(invalid_argument(
                "FieldPath must contain at least one segment",
            ));
        }
        Ok(Self { segments })
    }

    pub fn from_dot_separated(path: &str) -> SyncResult<Self> {
        if path.trim().is_empty() {
            return Err(invalid_argument("FieldPath string cannot be empty"));
        }
        FieldPath::new(path.split('.'))
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join(".")
    }

    pub fn is_prefix_of(&self, other: &FieldPath) -> bool {
        if self.segments.len() > other.segments.len() {
            return false;
        }
        self.segments
            .iter()
            .zip(other.segments.iter())
            .all(|(l, r)| l == r)
    }

    pub fn document_id() -> Self {
        Self {
            segments: vec!["__name__".to_string()],
        }
    }
}

/// The set of field paths a patch mutation touches.
///
/// A mask covers a path when any mask entry equals the path or is a prefix
/// of it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldMask {
    field_paths: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new<I>(paths: I) -> Self
    where
        I: IntoIterator<Item = FieldPath>,
    {
        Self {
            field_paths: paths.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn covers(&self, path: &FieldPath) -> bool {
        self.field_paths.iter().any(|mask| mask.is_prefix_of(path))
    }

    pub fn union(&self, other: &FieldMask) -> FieldMask {
        let mut paths = self.field_paths.clone();
        paths.extend(other.field_paths.iter().cloned());
        FieldMask { field_paths: paths }
    }

    pub fn insert(&mut self, path: FieldPath) {
        self.field_paths.insert(path);
    }

    pub fn paths(&self) -> impl Iterator<Item = &FieldPath> {
        self.field_paths.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.field_paths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_dot_path() {
        let field = FieldPath::from_dot_separated("foo.bar").unwrap();
        assert_eq!(field.segments(), &["foo", "bar"]);
    }

    #[test]
    fn rejects_empty() {
        let err = FieldPath::from_dot_separated("").unwrap_err();
        assert_eq!(err.code_str(), "invalid-argument");
    }

    #[test]
    fn mask_covers_nested_paths() {
        let mask = FieldMask::new([FieldPath::from_dot_separated("a").unwrap()]);
        assert!(mask.covers(&FieldPath::from_dot_separated("a.b").unwrap()));
        assert!(!mask.covers(&FieldPath::from_dot_separated("b").unwrap()));
    }
}
