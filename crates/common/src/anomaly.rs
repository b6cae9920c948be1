use std::fmt;

/// Where a "first of several" tie-break happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyKind {
    /// More than one key descriptor in a published key bundle
    KeyDescriptor,
    /// More than one key binary in a published key bundle
    KeyBinary,
    /// More than one stored document for a (project, organization) key
    StoredDocument,
    /// More than one source document for a project
    SourceDocument,
    /// A coded message parameter appeared more than once
    MessageParameter,
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnomalyKind::KeyDescriptor => "key-descriptor",
            AnomalyKind::KeyBinary => "key-binary",
            AnomalyKind::StoredDocument => "stored-document",
            AnomalyKind::SourceDocument => "source-document",
            AnomalyKind::MessageParameter => "message-parameter",
        };
        write!(f, "{}", s)
    }
}

/// A non-fatal ambiguity: several records matched where one was expected.
///
/// The first candidate (in the order the collaborator returned them) is
/// always the one used. Anomalies are logged when created and handed back
/// to the caller next to the successful result, they never abort a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeAnomaly {
    pub kind: AnomalyKind,
    /// Business key the lookup was made with
    pub key: String,
    /// How many records matched
    pub candidates: usize,
}

impl MergeAnomaly {
    fn new(kind: AnomalyKind, key: impl Into<String>, candidates: usize) -> Self {
        let anomaly = Self {
            kind,
            key: key.into(),
            candidates,
        };
        tracing::warn!(
            kind = %anomaly.kind,
            key = %anomaly.key,
            candidates = anomaly.candidates,
            "found {} matching records, using the first",
            anomaly.candidates
        );
        anomaly
    }
}

/// Deterministic tie-break: take the first item, report an anomaly if
/// there were more.
pub fn pick_first<T>(
    items: Vec<T>,
    kind: AnomalyKind,
    key: &str,
) -> (Option<T>, Option<MergeAnomaly>) {
    let count = items.len();
    let anomaly = (count > 1).then(|| MergeAnomaly::new(kind, key, count));
    (items.into_iter().next(), anomaly)
}
