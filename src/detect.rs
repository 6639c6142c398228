use crate::model::{StatusSnapshot, Transition};

/// Classify a fresh snapshot against the last stored status.
///
/// Comparison is exact: status text arrives already normalized from the
/// status source.
pub fn detect(previous: Option<&str>, fresh: &StatusSnapshot) -> Transition {
    let status = fresh.status.clone();
    if fresh.journey_complete {
        return Transition::Finalized {
            previous: previous.map(str::to_string),
            status,
        };
    }
    match previous {
        None => Transition::FirstSeen { status },
        Some(prev) if prev == status => Transition::Unchanged { status },
        Some(prev) => Transition::Updated {
            previous: prev.to_string(),
            status,
        },
    }
}
