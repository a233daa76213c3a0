//! Placement primitives.
//!
//! This library provides the building blocks the scheduler composes into
//! its placement pipeline. Key concepts:
//!
//! - **Filter**: a pure yes/no predicate over a (model, candidate) pair.
//! - **Sorter**: a pure strict-weak ordering over candidates for one model.
//! - **Chain**: an ordered slice of filters or sorters applied in sequence.
//!
//! # Invariants
//!
//! - Filters and sorters never mutate their inputs
//! - Decisions are deterministic given the same inputs
//! - Sorter chains are lexicographic: a later sorter only decides pairs every
//!   earlier sorter considers equal
//! - Sorting is stable, so equal candidates keep their input order

use std::cmp::Ordering;
use std::collections::BTreeSet;

use tracing::debug;

/// A placement predicate.
///
/// `M` is what is being placed, `C` the candidate it might be placed on.
pub trait Filter<M, C> {
    /// Short stable identifier, used in logs.
    fn name(&self) -> &'static str;

    /// Returns true if the candidate can host the model.
    fn filter(&self, model: &M, candidate: &C) -> bool;

    /// Human-readable explanation of the decision for this pair.
    fn description(&self, model: &M, candidate: &C) -> String;
}

/// A placement ordering.
pub trait Sorter<M, C> {
    fn name(&self) -> &'static str;

    /// Returns true if `a` should be preferred over `b` for `model`.
    fn is_less(&self, model: &M, a: &C, b: &C) -> bool;
}

/// Ordered filter chain.
pub type FilterChain<M, C> = Vec<Box<dyn Filter<M, C> + Send + Sync>>;

/// Ordered sorter chain, highest priority first.
pub type SorterChain<M, C> = Vec<Box<dyn Sorter<M, C> + Send + Sync>>;

// =============================================================================
// Filter chains
// =============================================================================

/// Returns the first filter in the chain that rejects the candidate.
pub fn first_rejection<'a, M, C>(
    filters: &'a [Box<dyn Filter<M, C> + Send + Sync>],
    model: &M,
    candidate: &C,
) -> Option<&'a Box<dyn Filter<M, C> + Send + Sync>> {
    filters.iter().find(|f| !f.filter(model, candidate))
}

/// Keeps the candidates that pass every filter, preserving input order.
///
/// Each rejection is logged at debug with the rejecting filter's
/// description.
pub fn retain_passing<M, C>(
    filters: &[Box<dyn Filter<M, C> + Send + Sync>],
    model: &M,
    candidates: Vec<C>,
) -> Vec<C> {
    candidates
        .into_iter()
        .filter(|candidate| match first_rejection(filters, model, candidate) {
            Some(rejected_by) => {
                debug!(
                    filter = rejected_by.name(),
                    reason = %rejected_by.description(model, candidate),
                    "Candidate rejected"
                );
                false
            }
            None => true,
        })
        .collect()
}

// =============================================================================
// Sorter chains
// =============================================================================

/// Compares two candidates with a sorter chain.
///
/// Sorters are consulted in order; the first one that prefers either side
/// decides.
pub fn compare_chain<M, C>(
    sorters: &[Box<dyn Sorter<M, C> + Send + Sync>],
    model: &M,
    a: &C,
    b: &C,
) -> Ordering {
    for sorter in sorters {
        if sorter.is_less(model, a, b) {
            return Ordering::Less;
        }
        if sorter.is_less(model, b, a) {
            return Ordering::Greater;
        }
    }
    Ordering::Equal
}

/// Stable sort of candidates by a sorter chain.
pub fn sort_candidates<M, C>(
    sorters: &[Box<dyn Sorter<M, C> + Send + Sync>],
    model: &M,
    candidates: &mut [C],
) {
    candidates.sort_by(|a, b| compare_chain(sorters, model, a, b));
}

// =============================================================================
// Capability matching
// =============================================================================

/// Trims every tag, dropping tags that are empty after trimming.
pub fn trim_tags<S: AsRef<str>>(tags: &[S]) -> Vec<String> {
    tags.iter()
        .map(|t| t.as_ref().trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Canonical form of a tag list for equality checks: trimmed, sorted and
/// deduplicated.
pub fn normalize_tags<S: AsRef<str>>(tags: &[S]) -> Vec<String> {
    trim_tags(tags)
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Returns true if every requirement appears among the capabilities.
///
/// Both sides are trimmed and compared by exact string equality. An empty
/// requirement list is always satisfied.
pub fn capabilities_satisfied<R, S>(requirements: &[R], capabilities: &[S]) -> bool
where
    R: AsRef<str>,
    S: AsRef<str>,
{
    let available: BTreeSet<&str> = capabilities.iter().map(|c| c.as_ref().trim()).collect();
    requirements
        .iter()
        .map(|r| r.as_ref().trim())
        .filter(|r| !r.is_empty())
        .all(|r| available.contains(r))
}
