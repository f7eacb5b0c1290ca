use crate::model::{DocumentKey, ObjectValue, SnapshotVersion};

/// What kind of entry the cache holds for a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentType {
    /// Nothing is known about the document.
    Invalid,
    /// The document exists and its data is known.
    FoundDocument,
    /// The document is known not to exist.
    NoDocument,
    /// The document exists but its data is unknown (e.g. a patch was
    /// acknowledged for a document the cache never held).
    UnknownDocument,
}

/// Sync state of a cache entry relative to pending writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentState {
    /// No pending writes affect the document.
    Synced,
    /// A locally queued mutation has been applied on top of the server
    /// state.
    HasLocalMutations,
    /// The server acknowledged a mutation but the watch stream has not yet
    /// caught up to the committed version.
    HasCommittedMutations,
}

/// A document entry in the local caches.
///
/// Mutated in place by mutation application; every read path hands out
/// clones so listeners always observe immutable snapshots.
#[derive(Clone, Debug, PartialEq)]
pub struct MutableDocument {
    key: DocumentKey,
    document_type: DocumentType,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    data: ObjectValue,
    document_state: DocumentState,
}

impl MutableDocument {
    pub fn invalid(key: DocumentKey) -> Self {
        Self {
            key,
            document_type: DocumentType::Invalid,
            version: SnapshotVersion::min(),
            read_time: SnapshotVersion::min(),
            data: ObjectValue::empty(),
            document_state: DocumentState::Synced,
        }
    }

    pub fn found_document(
        key: DocumentKey,
        version: SnapshotVersion,
        data: ObjectValue,
    ) -> Self {
        let mut doc = Self::invalid(key);
        doc.convert_to_found_document(version, data);
        doc
    }

    pub fn no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut doc = Self::invalid(key);
        doc.convert_to_no_document(version);
        doc
    }

    pub fn unknown_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut doc = Self::invalid(key);
        doc.convert_to_unknown_document(version);
        doc
    }

    pub fn convert_to_found_document(&mut self, version: SnapshotVersion, data: ObjectValue) {
        self.document_type = DocumentType::FoundDocument;
        self.version = version;
        self.data = data;
        self.document_state = DocumentState::Synced;
    }

    pub fn convert_to_no_document(&mut self, version: SnapshotVersion) {
        self.document_type = DocumentType::NoDocument;
        self.version = version;
        self.data = ObjectValue::empty();
        self.document_state = DocumentState::Synced;
    }

    pub fn convert_to_unknown_document(&mut self, version: SnapshotVersion) {
        self.document_type = DocumentType::UnknownDocument;
        self.version = version;
        self.data = ObjectValue::empty();
        self.document_state = DocumentState::HasCommittedMutations;
    }

    pub fn set_has_local_mutations(&mut self) {
        self.document_state = DocumentState::HasLocalMutations;
    }

    pub fn set_has_committed_mutations(&mut self) {
        self.document_state = DocumentState::HasCommittedMutations;
    }

    pub fn set_read_time(&mut self, read_time: SnapshotVersion) {
        self.read_time = read_time;
    }

    pub fn set_version(&mut self, version: SnapshotVersion) {
        self.version = version;
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    pub fn data(&self) -> &ObjectValue {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ObjectValue {
        &mut self.data
    }

    pub fn is_valid_document(&self) -> bool {
        self.document_type != DocumentType::Invalid
    }

    pub fn is_found_document(&self) -> bool {
        self.document_type == DocumentType::FoundDocument
    }

    pub fn is_no_document(&self) -> bool {
        self.document_type == DocumentType::NoDocument
    }

    pub fn is_unknown_document(&self) -> bool {
        self.document_type == DocumentType::UnknownDocument
    }

    pub fn has_local_mutations(&self) -> bool {
        self.document_state == DocumentState::HasLocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.document_state == DocumentState::HasCommittedMutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Timestamp;

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/alpha").unwrap()
    }

    #[test]
    fn found_document_is_synced() {
        let doc = MutableDocument::found_document(
            key(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            ObjectValue::empty(),
        );
        assert!(doc.is_found_document());
        assert!(!doc.has_pending_writes());
    }

    #[test]
    fn conversions_reset_data() {
        let mut doc = MutableDocument::found_document(
            key(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            ObjectValue::empty(),
        );
        doc.convert_to_no_document(SnapshotVersion::min());
        assert!(doc.is_no_document());
        assert_eq!(doc.version(), SnapshotVersion::min());
    }

    #[test]
    fn unknown_document_has_committed_mutations() {
        let doc =
            MutableDocument::unknown_document(key(), SnapshotVersion::new(Timestamp::new(5, 0)));
        assert!(doc.is_unknown_document());
        assert!(doc.has_committed_mutations());
    }
}
