//! Version conflict resolution
//!
//! Pure decisions over the local snapshot that was sent, the current local
//! document and the remote copy that rejected it. Automatic outcomes are only
//! produced when no inspection finding can be lost: identical content, or
//! edits confined to disjoint sections. Everything else goes to the user.

use std::collections::BTreeSet;

use crate::models::{OpKind, ReportDocument, SyncOperation, VersionConflict};
use crate::payload::Payload;

/// Inputs of a conflict decision
#[derive(Debug, Clone, Copy)]
pub struct ConflictInput<'a> {
    /// Operation whose write was rejected (payload as enqueued)
    pub snapshot: &'a SyncOperation,
    /// Local document as it is now
    pub current: &'a ReportDocument,
    pub remote_payload: &'a Payload,
    pub remote_version: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Local and remote content already match; adopt the remote version
    AlreadyInSync { remote_version: i64 },
    /// Non-overlapping section edits merged onto the remote copy
    Merged {
        payload: Payload,
        remote_version: i64,
        sections: Vec<String>,
    },
    /// User must choose
    Manual(VersionConflict),
}

/// User's answer to a manual conflict
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionChoice {
    KeepMine,
    KeepTheirs,
    Manual(Payload),
}

pub fn resolve(input: &ConflictInput<'_>) -> Resolution {
    let ConflictInput {
        snapshot,
        current,
        remote_payload,
        remote_version,
    } = *input;

    if snapshot.kind == OpKind::Delete {
        return manual(input);
    }

    if current.payload.canonical_eq(remote_payload) {
        return Resolution::AlreadyInSync { remote_version };
    }

    let no_further_edits = current.local_revision == snapshot.local_revision;
    if no_further_edits
        && let Some(base) = &current.confirmed_payload
        && let Ok((payload, sections)) = merge_sections(base, &snapshot.payload, remote_payload)
    {
        return Resolution::Merged {
            payload,
            remote_version,
            sections,
        };
    }

    manual(input)
}

/// Three-way merge at section granularity
///
/// Returns the merged payload and the local sections carried over, or the
/// sections edited on both sides.
pub fn merge_sections(
    base: &Payload,
    local: &Payload,
    remote: &Payload,
) -> Result<(Payload, Vec<String>), Vec<String>> {
    let local_changed = local.changed_sections(base);
    let remote_changed = remote.changed_sections(base);

    let overlapping: BTreeSet<&String> = local_changed.intersection(&remote_changed).collect();
    if !overlapping.is_empty() {
        return Err(overlapping.into_iter().cloned().collect());
    }

    let mut merged = remote.clone();
    for section in &local_changed {
        match local.get(section) {
            Some(value) => {
                merged.insert(section.clone(), value.clone());
            }
            None => {
                merged.remove(section);
            }
        }
    }

    Ok((merged, local_changed.into_iter().collect()))
}

/// Payload the user's choice leads to
pub fn chosen_payload(
    choice: &ResolutionChoice,
    current: &ReportDocument,
    conflict: &VersionConflict,
) -> Payload {
    match choice {
        ResolutionChoice::KeepMine => current.payload.clone(),
        ResolutionChoice::KeepTheirs => conflict.remote_current_payload.clone(),
        ResolutionChoice::Manual(payload) => payload.clone(),
    }
}

fn manual(input: &ConflictInput<'_>) -> Resolution {
    Resolution::Manual(VersionConflict {
        local_operation: input.snapshot.clone(),
        remote_current_payload: input.remote_payload.clone(),
        remote_current_version: input.remote_version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReportType;
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};

    fn payload(pairs: &[(&str, Value)]) -> Payload {
        pairs.iter().cloned().collect()
    }

    /// Document synced at version 5 with `base`, then edited to `local`
    fn edited_doc(base: &Payload, local: &Payload) -> (ReportDocument, SyncOperation) {
        let mut doc = ReportDocument::new("r1", ReportType::Eicr);
        doc.payload = local.clone();
        doc.confirmed_payload = Some(base.clone());
        doc.server_version = Some(5);
        doc.local_revision = 6;
        doc.dirty = true;
        let op = SyncOperation::from_document(&doc, OpKind::Update);
        (doc, op)
    }

    #[test]
    fn equal_payloads_resolve_without_prompt() {
        let base = payload(&[("client", json!("A"))]);
        let local = payload(&[("client", json!("B")), ("supply", json!({"ze": 0.35}))]);
        let remote = payload(&[("supply", json!({"ze": 0.35})), ("client", json!("B"))]);
        let (doc, op) = edited_doc(&base, &local);

        let resolution = resolve(&ConflictInput {
            snapshot: &op,
            current: &doc,
            remote_payload: &remote,
            remote_version: 6,
        });

        assert_eq!(resolution, Resolution::AlreadyInSync { remote_version: 6 });
    }

    #[test]
    fn disjoint_sections_merge() {
        let base = payload(&[("client", json!("A")), ("observations", json!([]))]);
        let local = payload(&[("client", json!("A")), ("observations", json!(["C2"]))]);
        let remote = payload(&[
            ("client", json!("A Ltd")),
            ("observations", json!([])),
            ("supply", json!("TN-C-S")),
        ]);
        let (doc, op) = edited_doc(&base, &local);

        let resolution = resolve(&ConflictInput {
            snapshot: &op,
            current: &doc,
            remote_payload: &remote,
            remote_version: 6,
        });

        let Resolution::Merged {
            payload: merged,
            remote_version,
            sections,
        } = resolution
        else {
            panic!("expected merge, got {resolution:?}");
        };
        assert_eq!(remote_version, 6);
        assert_eq!(sections, vec!["observations"]);
        assert_eq!(
            merged,
            payload(&[
                ("client", json!("A Ltd")),
                ("observations", json!(["C2"])),
                ("supply", json!("TN-C-S")),
            ])
        );
    }

    #[test]
    fn local_section_removal_survives_merge() {
        let base = payload(&[("a", json!(1)), ("b", json!(2))]);
        let local = payload(&[("b", json!(2))]);
        let remote = payload(&[("a", json!(1)), ("b", json!(2)), ("c", json!(3))]);

        let (merged, sections) = merge_sections(&base, &local, &remote).unwrap();

        assert_eq!(sections, vec!["a"]);
        assert_eq!(merged, payload(&[("b", json!(2)), ("c", json!(3))]));
    }

    #[test]
    fn section_edited_on_both_sides_needs_user() {
        let base = payload(&[("observations", json!([]))]);
        let local = payload(&[("observations", json!(["C1 exposed live parts"]))]);
        let remote = payload(&[("observations", json!(["C3 no RCD"]))]);
        let (doc, op) = edited_doc(&base, &local);

        let resolution = resolve(&ConflictInput {
            snapshot: &op,
            current: &doc,
            remote_payload: &remote,
            remote_version: 6,
        });

        let Resolution::Manual(conflict) = resolution else {
            panic!("expected manual resolution");
        };
        assert_eq!(conflict.remote_current_version, 6);
        assert_eq!(conflict.remote_current_payload, remote);
        assert_eq!(conflict.local_operation.op_id, op.op_id);
        assert_eq!(
            merge_sections(&base, &local, &remote).unwrap_err(),
            vec!["observations"]
        );
    }

    #[test]
    fn further_local_edits_block_automatic_merge() {
        let base = payload(&[("a", json!(1)), ("b", json!(1))]);
        let local = payload(&[("a", json!(2)), ("b", json!(1))]);
        let remote = payload(&[("a", json!(1)), ("b", json!(9))]);
        let (mut doc, op) = edited_doc(&base, &local);
        doc.local_revision += 1;

        let resolution = resolve(&ConflictInput {
            snapshot: &op,
            current: &doc,
            remote_payload: &remote,
            remote_version: 6,
        });

        assert!(matches!(resolution, Resolution::Manual(_)));
    }

    #[test]
    fn missing_merge_base_needs_user() {
        let local = payload(&[("a", json!(2))]);
        let remote = payload(&[("b", json!(9))]);
        let (mut doc, op) = edited_doc(&Payload::new(), &local);
        doc.confirmed_payload = None;

        let resolution = resolve(&ConflictInput {
            snapshot: &op,
            current: &doc,
            remote_payload: &remote,
            remote_version: 6,
        });

        assert!(matches!(resolution, Resolution::Manual(_)));
    }

    #[test]
    fn deletes_always_need_user() {
        let base = payload(&[("a", json!(1))]);
        let (doc, mut op) = edited_doc(&base, &base);
        op.kind = OpKind::Delete;

        let resolution = resolve(&ConflictInput {
            snapshot: &op,
            current: &doc,
            remote_payload: &base,
            remote_version: 6,
        });

        assert!(matches!(resolution, Resolution::Manual(_)));
    }

    #[test]
    fn choices_pick_the_expected_payload() {
        let mine = payload(&[("a", json!("mine"))]);
        let theirs = payload(&[("a", json!("theirs"))]);
        let (doc, op) = edited_doc(&Payload::new(), &mine);
        let conflict = VersionConflict {
            local_operation: op,
            remote_current_payload: theirs.clone(),
            remote_current_version: 6,
        };
        let custom = payload(&[("a", json!("both"))]);

        assert_eq!(chosen_payload(&ResolutionChoice::KeepMine, &doc, &conflict), mine);
        assert_eq!(chosen_payload(&ResolutionChoice::KeepTheirs, &doc, &conflict), theirs);
        assert_eq!(
            chosen_payload(&ResolutionChoice::Manual(custom.clone()), &doc, &conflict),
            custom
        );
    }
}
