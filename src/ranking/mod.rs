//! Candidate ranking: orders discovered environments by how well they fit a
//! document's declared language and kernel spec.
//!
//! The result is ascending: least preferred first, recommendation last.
//! Pure functions only; inputs are never mutated.

use crate::environment::{CandidateEnvironment, DocumentMetadata, InterpreterRef};

/// Confidence tier of a single candidate. Higher sorts later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchTier {
    None,
    Language,
    InterpreterAndLanguage,
    KernelSpecName,
}

/// Tier of `candidate` for `document`, given the active interpreter.
pub fn match_tier(
    document: &DocumentMetadata,
    candidate: &CandidateEnvironment,
    active_interpreter: Option<&InterpreterRef>,
) -> MatchTier {
    if let (Some(hint), Some(name)) = (document.kernel_spec_name(), candidate.kernel_spec_name()) {
        if hint == name {
            return MatchTier::KernelSpecName;
        }
    }

    if !candidate.speaks(&document.language) {
        return MatchTier::None;
    }

    match (active_interpreter, candidate.interpreter.as_ref()) {
        _ if candidate.synthetic => MatchTier::Language,
        (Some(active), Some(own)) if active.same_as(own) => MatchTier::InterpreterAndLanguage,
        _ => MatchTier::Language,
    }
}

/// Rank `candidates` for `document`.
///
/// Ties keep their input order. A python document with no kernel-spec match
/// gets a synthetic candidate for the active interpreter (unless one of the
/// candidates already wraps it), placed last within the language tier.
pub fn rank_candidates(
    document: &DocumentMetadata,
    candidates: &[CandidateEnvironment],
    active_interpreter: Option<&InterpreterRef>,
) -> Vec<CandidateEnvironment> {
    let mut scored: Vec<(MatchTier, CandidateEnvironment)> = candidates
        .iter()
        .map(|c| (match_tier(document, c, active_interpreter), c.clone()))
        .collect();

    if let Some(active) = active_interpreter {
        let has_spec_match = scored.iter().any(|(t, _)| *t == MatchTier::KernelSpecName);
        let already_listed = candidates
            .iter()
            .any(|c| c.speaks(&document.language) && c.interpreter.as_ref().is_some_and(|i| i.same_as(active)));

        if document.is_python() && !has_spec_match && !already_listed {
            tracing::debug!(
                "No kernel spec matches '{}', adding interpreter candidate {}",
                document.kernel_spec_name().unwrap_or("<none>"),
                active.path.display()
            );
            let synthetic = CandidateEnvironment::synthetic_for(active);
            scored.push((match_tier(document, &synthetic, active_interpreter), synthetic));
        }
    }

    // sort_by_key is stable, so equal tiers keep their relative order
    scored.sort_by_key(|(tier, _)| *tier);
    scored.into_iter().map(|(_, c)| c).collect()
}

/// Whether `candidate` is an exact match and further disambiguation can be
/// skipped.
///
/// Only kernel-spec name matches qualify. When several candidates share the
/// hinted name, the one whose interpreter equals the document's recorded
/// interpreter is the exact match and the rest are not. Documents in a
/// language no candidate speaks never have an exact match.
pub fn is_exact_match(
    document: &DocumentMetadata,
    candidate: &CandidateEnvironment,
    candidates: &[CandidateEnvironment],
) -> bool {
    if !candidates.iter().any(|c| c.speaks(&document.language)) {
        return false;
    }
    if !candidate.speaks(&document.language) {
        return false;
    }
    let Some(hint) = document.kernel_spec_name() else {
        return false;
    };
    if candidate.kernel_spec_name() != Some(hint) {
        return false;
    }

    let same_name = candidates
        .iter()
        .filter(|c| c.kernel_spec_name() == Some(hint))
        .count();
    if same_name <= 1 {
        return true;
    }

    match (&document.interpreter, &candidate.interpreter) {
        (Some(recorded), Some(own)) => own.is_at(recorded),
        _ => false,
    }
}
