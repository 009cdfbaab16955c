//! Wavelets: identifiers, hashed versions, deltas and wavelet operations.
//!
//! A wavelet is a set of participants plus a set of documents, versioned
//! by the number of operations ever applied to it. Every version carries a
//! BLAKE3 hash chaining it to the one before, so two replicas that agree on
//! a hashed version agree on the whole history behind it.
//!
//! ```text
//!   zero ──delta(3 ops)──▶ v3 ──delta(1 op)──▶ v4
//!   h0 = H("wave://w/l")   h3 = H(h0 ‖ ops)    h4 = H(h3 ‖ ops)
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::algorithm::{compose, invert, transform};
use crate::annotations::AnnotationBoundary;
use crate::attributes::{Attributes, AttributesUpdate};
use crate::document::{Document, DocumentModel};
use crate::error::{
    ComposeError, InvalidParticipant, MalformedOperation, TransformError, WaveletApplyError,
};
use crate::op::{DocOp, DocOpCursor};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WaveId(String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WaveletId(String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl WaveId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl WaveletId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A participant address, `name@domain`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(address: impl Into<String>) -> Result<Self, InvalidParticipant> {
        let address = address.into();
        match address.split_once('@') {
            Some((name, domain))
                if !name.is_empty() && !domain.is_empty() && !domain.contains('@') =>
            {
                Ok(Self(address))
            }
            _ => Err(InvalidParticipant(address)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn domain(&self) -> &str {
        self.0.split_once('@').map(|(_, d)| d).unwrap_or_default()
    }
}

impl TryFrom<String> for ParticipantId {
    type Error = InvalidParticipant;

    fn try_from(address: String) -> Result<Self, Self::Error> {
        Self::new(address)
    }
}

impl From<ParticipantId> for String {
    fn from(id: ParticipantId) -> Self {
        id.0
    }
}

impl fmt::Display for WaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for WaveletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Versions
// ============================================================================

/// A version number together with the hash of the history leading to it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashedVersion {
    pub version: u64,
    pub hash: [u8; 32],
}

impl HashedVersion {
    /// The version of a wavelet nothing has been applied to yet.
    pub fn zero(wave_id: &WaveId, wavelet_id: &WaveletId) -> Self {
        let uri = format!("wave://{wave_id}/{wavelet_id}");
        Self {
            version: 0,
            hash: *blake3::hash(uri.as_bytes()).as_bytes(),
        }
    }

    /// The version reached by applying `ops` by `author` on top of this one.
    pub fn next(&self, author: &ParticipantId, ops: &[WaveletOperation]) -> Self {
        let mut hasher = CanonicalHasher(blake3::Hasher::new());
        hasher.0.update(&self.hash);
        hasher.str(author.as_str());
        hasher.u64(ops.len() as u64);
        for op in ops {
            hasher.operation(op);
        }
        Self {
            version: self.version + ops.len() as u64,
            hash: *hasher.0.finalize().as_bytes(),
        }
    }
}

impl fmt::Display for HashedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.version)?;
        for byte in &self.hash[..4] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for HashedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashedVersion({self})")
    }
}

/// Feeds a stable byte encoding of operations into BLAKE3. Independent of
/// the wire format, so changing serialization never changes history hashes.
struct CanonicalHasher(blake3::Hasher);

impl CanonicalHasher {
    fn tag(&mut self, tag: u8) {
        self.0.update(&[tag]);
    }

    fn u64(&mut self, value: u64) {
        self.0.update(&value.to_le_bytes());
    }

    fn str(&mut self, value: &str) {
        self.u64(value.len() as u64);
        self.0.update(value.as_bytes());
    }

    fn opt(&mut self, value: Option<&str>) {
        match value {
            None => self.tag(0),
            Some(value) => {
                self.tag(1);
                self.str(value);
            }
        }
    }

    fn attributes(&mut self, attributes: &Attributes) {
        self.u64(attributes.len() as u64);
        for (key, value) in attributes.iter() {
            self.str(key);
            self.str(value);
        }
    }

    fn operation(&mut self, op: &WaveletOperation) {
        match op {
            WaveletOperation::Document { document, op } => {
                self.tag(1);
                self.str(document.as_str());
                self.u64(op.len() as u64);
                op.apply(self);
            }
            WaveletOperation::AddParticipant(p) => {
                self.tag(2);
                self.str(p.as_str());
            }
            WaveletOperation::RemoveParticipant(p) => {
                self.tag(3);
                self.str(p.as_str());
            }
            WaveletOperation::NoOp => self.tag(4),
        }
    }
}

impl DocOpCursor for CanonicalHasher {
    fn retain(&mut self, count: usize) {
        self.tag(0);
        self.u64(count as u64);
    }

    fn characters(&mut self, chars: &str) {
        self.tag(1);
        self.str(chars);
    }

    fn element_start(&mut self, tag: &str, attributes: &Attributes) {
        self.tag(2);
        self.str(tag);
        self.attributes(attributes);
    }

    fn element_end(&mut self) {
        self.tag(3);
    }

    fn delete_characters(&mut self, chars: &str) {
        self.tag(4);
        self.str(chars);
    }

    fn delete_element_start(&mut self, tag: &str, attributes: &Attributes) {
        self.tag(5);
        self.str(tag);
        self.attributes(attributes);
    }

    fn delete_element_end(&mut self) {
        self.tag(6);
    }

    fn replace_attributes(&mut self, old: &Attributes, new: &Attributes) {
        self.tag(7);
        self.attributes(old);
        self.attributes(new);
    }

    fn update_attributes(&mut self, update: &AttributesUpdate) {
        self.tag(8);
        self.u64(update.len() as u64);
        for change in update.iter() {
            self.str(&change.key);
            self.opt(change.old.as_deref());
            self.opt(change.new.as_deref());
        }
    }

    fn annotation_boundary(&mut self, boundary: &AnnotationBoundary) {
        self.tag(9);
        self.u64(boundary.ends().len() as u64);
        for key in boundary.ends() {
            self.str(key);
        }
        self.u64(boundary.changes().len() as u64);
        for change in boundary.changes() {
            self.str(&change.key);
            self.opt(change.old.as_deref());
            self.opt(change.new.as_deref());
        }
    }
}

// ============================================================================
// Operations
// ============================================================================

/// One change to a wavelet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaveletOperation {
    Document { document: DocumentId, op: DocOp },
    AddParticipant(ParticipantId),
    RemoveParticipant(ParticipantId),
    NoOp,
}

impl WaveletOperation {
    pub fn document(document: DocumentId, op: DocOp) -> Self {
        WaveletOperation::Document { document, op }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, WaveletOperation::NoOp)
    }
}

/// Transform two concurrent wavelet operations, server first on ties.
pub fn transform_operations(
    client: &WaveletOperation,
    server: &WaveletOperation,
) -> Result<(WaveletOperation, WaveletOperation), TransformError> {
    match (client, server) {
        (
            WaveletOperation::Document {
                document: client_doc,
                op: client_op,
            },
            WaveletOperation::Document {
                document: server_doc,
                op: server_op,
            },
        ) if client_doc == server_doc => {
            let (client_op, server_op) = transform(client_op, server_op)?;
            Ok((
                WaveletOperation::document(client_doc.clone(), client_op),
                WaveletOperation::document(server_doc.clone(), server_op),
            ))
        }
        (WaveletOperation::AddParticipant(a), WaveletOperation::AddParticipant(b))
        | (WaveletOperation::RemoveParticipant(a), WaveletOperation::RemoveParticipant(b))
            if a == b =>
        {
            Ok((WaveletOperation::NoOp, WaveletOperation::NoOp))
        }
        (WaveletOperation::AddParticipant(a), WaveletOperation::RemoveParticipant(b))
        | (WaveletOperation::RemoveParticipant(a), WaveletOperation::AddParticipant(b))
            if a == b =>
        {
            Err(TransformError::Conflict {
                key: a.as_str().to_owned(),
            })
        }
        _ => Ok((client.clone(), server.clone())),
    }
}

/// Transform two concurrent operation lists against each other.
pub fn transform_operation_lists(
    client: &[WaveletOperation],
    server: &[WaveletOperation],
) -> Result<(Vec<WaveletOperation>, Vec<WaveletOperation>), TransformError> {
    let mut client = client.to_vec();
    let mut server_out = Vec::with_capacity(server.len());
    for server_op in server {
        let mut server_op = server_op.clone();
        for client_op in client.iter_mut() {
            let (c, s) = transform_operations(client_op, &server_op)?;
            *client_op = c;
            server_op = s;
        }
        server_out.push(server_op);
    }
    Ok((client, server_out))
}

/// Append `op` to `ops`, composing it into the last operation when both
/// edit the same document. No-ops are dropped.
pub fn compose_into(
    ops: &mut Vec<WaveletOperation>,
    op: WaveletOperation,
) -> Result<(), ComposeError> {
    if op.is_noop() {
        return Ok(());
    }
    if let (
        Some(WaveletOperation::Document {
            document: last_document,
            op: last_op,
        }),
        WaveletOperation::Document { document, op: next },
    ) = (ops.last_mut(), &op)
    {
        if last_document == document {
            *last_op = compose(last_op, next)?;
            return Ok(());
        }
    }
    ops.push(op);
    Ok(())
}

pub fn invert_operation(op: &WaveletOperation) -> WaveletOperation {
    match op {
        WaveletOperation::Document { document, op } => {
            WaveletOperation::document(document.clone(), invert(op))
        }
        WaveletOperation::AddParticipant(p) => WaveletOperation::RemoveParticipant(p.clone()),
        WaveletOperation::RemoveParticipant(p) => WaveletOperation::AddParticipant(p.clone()),
        WaveletOperation::NoOp => WaveletOperation::NoOp,
    }
}

// ============================================================================
// Deltas and snapshots
// ============================================================================

/// A batch of operations a client submits against a version it has seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveletDelta {
    pub author: ParticipantId,
    pub target_version: HashedVersion,
    pub ops: Vec<WaveletOperation>,
}

/// A delta as the server applied it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformedDelta {
    pub author: ParticipantId,
    pub applied_at: HashedVersion,
    pub resulting_version: HashedVersion,
    /// Milliseconds since the Unix epoch, server clock.
    pub timestamp: u64,
    pub ops: Vec<WaveletOperation>,
}

impl TransformedDelta {
    /// Whether `resulting_version` is what `applied_at` plus these ops hashes to.
    pub fn is_consistent(&self) -> bool {
        self.applied_at.next(&self.author, &self.ops) == self.resulting_version
    }
}

/// Full state of a wavelet at one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveletSnapshot {
    pub wavelet_id: WaveletId,
    pub creator: Option<ParticipantId>,
    pub participants: Vec<ParticipantId>,
    /// Each document as the insert-only operation that builds it.
    pub documents: Vec<(DocumentId, DocOp)>,
    pub version: HashedVersion,
    pub committed_version: u64,
}

impl WaveletSnapshot {
    /// The operations that rebuild this state from an empty wavelet.
    pub fn to_operations(&self) -> Vec<WaveletOperation> {
        self.participants
            .iter()
            .cloned()
            .map(WaveletOperation::AddParticipant)
            .chain(
                self.documents
                    .iter()
                    .map(|(id, op)| WaveletOperation::document(id.clone(), op.clone())),
            )
            .collect()
    }
}

// ============================================================================
// Wavelet state
// ============================================================================

/// Participants and documents of one wavelet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaveletData<D = Document> {
    wave_id: WaveId,
    wavelet_id: WaveletId,
    creator: Option<ParticipantId>,
    participants: Vec<ParticipantId>,
    documents: BTreeMap<DocumentId, D>,
    version: HashedVersion,
}

impl<D: DocumentModel + Default> WaveletData<D> {
    pub fn new(wave_id: WaveId, wavelet_id: WaveletId) -> Self {
        let version = HashedVersion::zero(&wave_id, &wavelet_id);
        Self {
            wave_id,
            wavelet_id,
            creator: None,
            participants: Vec::new(),
            documents: BTreeMap::new(),
            version,
        }
    }

    pub fn from_snapshot(
        wave_id: WaveId,
        snapshot: &WaveletSnapshot,
    ) -> Result<Self, WaveletApplyError> {
        let mut data = Self::new(wave_id, snapshot.wavelet_id.clone());
        for op in snapshot.to_operations() {
            data.apply_operation(&op)?;
        }
        data.creator = snapshot.creator.clone();
        data.version = snapshot.version;
        Ok(data)
    }

    pub fn wave_id(&self) -> &WaveId {
        &self.wave_id
    }

    pub fn wavelet_id(&self) -> &WaveletId {
        &self.wavelet_id
    }

    pub fn creator(&self) -> Option<&ParticipantId> {
        self.creator.as_ref()
    }

    pub fn participants(&self) -> &[ParticipantId] {
        &self.participants
    }

    pub fn is_participant(&self, participant: &ParticipantId) -> bool {
        self.participants.contains(participant)
    }

    pub fn document(&self, id: &DocumentId) -> Option<&D> {
        self.documents.get(id)
    }

    pub fn documents(&self) -> impl Iterator<Item = (&DocumentId, &D)> {
        self.documents.iter()
    }

    pub fn version(&self) -> HashedVersion {
        self.version
    }

    /// Apply one operation. On error nothing has changed.
    ///
    /// Does not touch the version; see [`WaveletData::apply_delta`].
    pub fn apply_operation(&mut self, op: &WaveletOperation) -> Result<(), WaveletApplyError> {
        match op {
            WaveletOperation::Document { document, op } => {
                let doc = self.documents.entry(document.clone()).or_default();
                doc.apply_op(op)
                    .map_err(|source| WaveletApplyError::Document {
                        document: document.to_string(),
                        source,
                    })
            }
            WaveletOperation::AddParticipant(p) => {
                if self.participants.contains(p) {
                    return Err(WaveletApplyError::ParticipantAlreadyPresent(p.to_string()));
                }
                self.participants.push(p.clone());
                Ok(())
            }
            WaveletOperation::RemoveParticipant(p) => {
                let index = self
                    .participants
                    .iter()
                    .position(|q| q == p)
                    .ok_or_else(|| WaveletApplyError::ParticipantNotPresent(p.to_string()))?;
                self.participants.remove(index);
                Ok(())
            }
            WaveletOperation::NoOp => Ok(()),
        }
    }
}

impl<D: DocumentModel + Default + Clone> WaveletData<D> {
    /// Apply a whole delta at the current version, all or nothing.
    ///
    /// The first delta applied at version zero makes its author the creator.
    pub fn apply_delta(
        &mut self,
        author: &ParticipantId,
        ops: &[WaveletOperation],
    ) -> Result<HashedVersion, WaveletApplyError> {
        let mut next = self.clone();
        for op in ops {
            next.apply_operation(op)?;
        }
        if next.version.version == 0 && next.creator.is_none() {
            next.creator = Some(author.clone());
        }
        next.version = self.version.next(author, ops);
        *self = next;
        Ok(self.version)
    }
}

impl WaveletData<Document> {
    pub fn snapshot(&self, committed_version: u64) -> Result<WaveletSnapshot, MalformedOperation> {
        let documents = self
            .documents
            .iter()
            .map(|(id, doc)| Ok((id.clone(), doc.to_initialization()?)))
            .collect::<Result<Vec<_>, MalformedOperation>>()?;
        Ok(WaveletSnapshot {
            wavelet_id: self.wavelet_id.clone(),
            creator: self.creator.clone(),
            participants: self.participants.clone(),
            documents,
            version: self.version,
            committed_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> ParticipantId {
        ParticipantId::new("alice@example.com").unwrap()
    }

    fn bob() -> ParticipantId {
        ParticipantId::new("bob@example.com").unwrap()
    }

    fn insert(document: &str, text: &str, size: usize) -> WaveletOperation {
        let mut builder = DocOp::builder();
        builder.characters(text);
        if size > 0 {
            builder.retain(size);
        }
        WaveletOperation::document(DocumentId::new(document), builder.build().unwrap())
    }

    fn ids() -> (WaveId, WaveletId) {
        (WaveId::new("example.com/w+1"), WaveletId::new("conv+root"))
    }

    #[test]
    fn test_participant_validation() {
        assert!(ParticipantId::new("alice@example.com").is_ok());
        assert!(ParticipantId::new("alice").is_err());
        assert!(ParticipantId::new("@example.com").is_err());
        assert!(ParticipantId::new("a@b@c").is_err());
        assert_eq!(alice().domain(), "example.com");
    }

    #[test]
    fn test_version_hash_chain() {
        let (wave, wavelet) = ids();
        let zero = HashedVersion::zero(&wave, &wavelet);
        assert_eq!(zero, HashedVersion::zero(&wave, &wavelet));
        assert_ne!(zero, HashedVersion::zero(&wave, &WaveletId::new("other")));

        let ops = vec![insert("b+1", "hi", 0), WaveletOperation::NoOp];
        let next = zero.next(&alice(), &ops);
        assert_eq!(next.version, 2);
        assert_eq!(next, zero.next(&alice(), &ops));
        assert_ne!(next.hash, zero.next(&bob(), &ops).hash);
        assert_ne!(next.hash, zero.next(&alice(), &ops[..1]).hash);
    }

    #[test]
    fn test_participant_transforms() {
        let add = WaveletOperation::AddParticipant(bob());
        let remove = WaveletOperation::RemoveParticipant(bob());
        assert_eq!(
            transform_operations(&add, &add).unwrap(),
            (WaveletOperation::NoOp, WaveletOperation::NoOp)
        );
        assert!(matches!(
            transform_operations(&add, &remove),
            Err(TransformError::Conflict { .. })
        ));
        let other = WaveletOperation::AddParticipant(alice());
        assert_eq!(
            transform_operations(&add, &other).unwrap(),
            (add.clone(), other.clone())
        );
    }

    #[test]
    fn test_list_transform_converges() {
        let (wave, wavelet) = ids();
        let mut base: WaveletData = WaveletData::new(wave, wavelet);
        base.apply_operation(&insert("b+1", "ab", 0)).unwrap();

        let client = vec![insert("b+1", "x", 2), insert("b+1", "y", 3)];
        let server = vec![insert("b+1", "s", 2), WaveletOperation::AddParticipant(bob())];
        let (client_prime, server_prime) = transform_operation_lists(&client, &server).unwrap();

        let mut via_client = base.clone();
        for op in client.iter().chain(&server_prime) {
            via_client.apply_operation(op).unwrap();
        }
        let mut via_server = base.clone();
        for op in server.iter().chain(&client_prime) {
            via_server.apply_operation(op).unwrap();
        }
        let doc = DocumentId::new("b+1");
        assert_eq!(via_client.document(&doc), via_server.document(&doc));
        assert_eq!(via_client.document(&doc).unwrap().text(), "syxab");
        assert!(via_server.is_participant(&bob()));
    }

    #[test]
    fn test_compose_into_merges_same_document() {
        let mut ops = Vec::new();
        compose_into(&mut ops, insert("b+1", "a", 0)).unwrap();
        compose_into(&mut ops, insert("b+1", "b", 1)).unwrap();
        compose_into(&mut ops, WaveletOperation::NoOp).unwrap();
        compose_into(&mut ops, insert("b+2", "c", 0)).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0], insert("b+1", "ba", 0));
    }

    #[test]
    fn test_invert_operation() {
        assert_eq!(
            invert_operation(&WaveletOperation::AddParticipant(bob())),
            WaveletOperation::RemoveParticipant(bob())
        );
        let op = insert("b+1", "a", 0);
        assert_eq!(invert_operation(&invert_operation(&op)), op);
    }

    #[test]
    fn test_apply_delta_is_atomic() {
        let (wave, wavelet) = ids();
        let mut data: WaveletData = WaveletData::new(wave, wavelet);
        let version = data
            .apply_delta(&alice(), &[WaveletOperation::AddParticipant(alice())])
            .unwrap();
        assert_eq!(version.version, 1);
        assert_eq!(data.creator(), Some(&alice()));

        let before = data.clone();
        let bad = [
            insert("b+1", "ok", 0),
            WaveletOperation::AddParticipant(alice()),
        ];
        assert_eq!(
            data.apply_delta(&bob(), &bad),
            Err(WaveletApplyError::ParticipantAlreadyPresent(
                "alice@example.com".into()
            ))
        );
        assert_eq!(data, before);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let (wave, wavelet) = ids();
        let mut data: WaveletData = WaveletData::new(wave.clone(), wavelet);
        data.apply_delta(
            &alice(),
            &[
                WaveletOperation::AddParticipant(alice()),
                insert("b+1", "hello", 0),
            ],
        )
        .unwrap();
        let snapshot = data.snapshot(0).unwrap();
        assert_eq!(snapshot.version.version, 2);
        let restored = WaveletData::from_snapshot(wave, &snapshot).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn test_participant_serde_validates() {
        let config = bincode::config::standard();
        let bytes = bincode::serde::encode_to_vec("nobody".to_string(), config).unwrap();
        let decoded: Result<(ParticipantId, usize), _> =
            bincode::serde::decode_from_slice(&bytes, config);
        assert!(decoded.is_err());
    }
}
