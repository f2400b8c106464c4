use std::collections::{HashMap, HashSet};

use crate::cli::AdjacencyTieBreak;
use crate::error::MergeInvariantViolation;
use crate::model::{Candidate, CandidateGroup, QueryKind};

const MERGED_TEXT_SEPARATOR: &str = " ";

#[derive(Debug, Clone)]
struct MergeWindow {
    source: String,
    bounds: Option<(i64, i64)>,
    members: Vec<Candidate>,
}

impl MergeWindow {
    fn open(candidate: Candidate) -> Self {
        let bounds = candidate.resolved_sequence_key().map(|key| (key, key));
        Self {
            source: candidate.source().to_string(),
            bounds,
            members: vec![candidate],
        }
    }

    fn accepts(&self, source: &str, key: i64) -> bool {
        let Some((lower, upper)) = self.bounds else {
            return false;
        };
        self.source == source
            && (upper.checked_add(1) == Some(key) || lower.checked_sub(1) == Some(key))
    }

    fn extend(&mut self, candidate: Candidate, key: i64) {
        if let Some((lower, upper)) = self.bounds.as_mut() {
            *lower = (*lower).min(key);
            *upper = (*upper).max(key);
        }
        self.members.push(candidate);
    }

    fn into_group(mut self) -> CandidateGroup {
        if self.members.len() == 1 {
            return CandidateGroup::singleton(self.members.remove(0));
        }

        self.members
            .sort_by_key(|member| member.resolved_sequence_key().unwrap_or(i64::MAX));
        let best_rank = self
            .members
            .iter()
            .map(|member| member.rank)
            .min()
            .unwrap_or(u32::MAX);
        let (lower, upper) = self.bounds.unwrap_or_default();
        let text = self
            .members
            .iter()
            .map(|member| member.text.as_str())
            .collect::<Vec<&str>>()
            .join(MERGED_TEXT_SEPARATOR);

        CandidateGroup {
            label: format!("{}:{lower}-{upper}", self.source),
            source: self.source,
            best_rank,
            text,
            members: self.members,
        }
    }
}

/// Groups a query's candidates into judgable units, best-ranked group first.
///
/// Verse candidates are scanned in rank order; each one extends an open window
/// when it sits directly before or after that window's verse range in the same
/// chapter, otherwise it opens a new window. Hadith candidates are never merged.
pub fn merge_candidates(
    kind: QueryKind,
    candidates: &[Candidate],
    tie_break: AdjacencyTieBreak,
) -> Result<Vec<CandidateGroup>, MergeInvariantViolation> {
    let ordered = rank_ordered(candidates)?;

    let mut groups = match kind {
        QueryKind::Ayah => merge_consecutive_verses(ordered, tie_break),
        QueryKind::Hadith => ordered.into_iter().map(CandidateGroup::singleton).collect(),
    };
    groups.sort_by_key(|group| group.best_rank);

    verify_coverage(candidates, &groups)?;
    Ok(groups)
}

fn rank_ordered(candidates: &[Candidate]) -> Result<Vec<Candidate>, MergeInvariantViolation> {
    let mut ordered = candidates.to_vec();
    ordered.sort_by_key(|candidate| candidate.rank);

    if let Some(pair) = ordered.windows(2).find(|pair| pair[0].rank == pair[1].rank) {
        return Err(MergeInvariantViolation::DuplicateRank { rank: pair[0].rank });
    }

    Ok(ordered)
}

fn merge_consecutive_verses(
    ordered: Vec<Candidate>,
    tie_break: AdjacencyTieBreak,
) -> Vec<CandidateGroup> {
    let mut windows = Vec::<MergeWindow>::new();

    for candidate in ordered {
        let Some(key) = candidate.resolved_sequence_key() else {
            windows.push(MergeWindow::open(candidate));
            continue;
        };

        let source = candidate.source().to_string();
        let mut adjacent = windows
            .iter()
            .enumerate()
            .filter(|(_, window)| window.accepts(&source, key))
            .map(|(index, _)| index);

        // windows are pushed in opening order
        let target = match tie_break {
            AdjacencyTieBreak::MostRecent => adjacent.next_back(),
            AdjacencyTieBreak::Earliest => adjacent.next(),
        };

        match target {
            Some(index) => windows[index].extend(candidate, key),
            None => windows.push(MergeWindow::open(candidate)),
        }
    }

    windows.into_iter().map(MergeWindow::into_group).collect()
}

/// Checks that every input candidate lands in exactly one well-formed group.
pub fn verify_coverage(
    input: &[Candidate],
    groups: &[CandidateGroup],
) -> Result<(), MergeInvariantViolation> {
    let by_rank = input
        .iter()
        .map(|candidate| (candidate.rank, candidate))
        .collect::<HashMap<u32, &Candidate>>();
    let mut seen = HashSet::<u32>::new();

    for group in groups {
        for member in &group.members {
            match by_rank.get(&member.rank) {
                Some(original) if *original == member => {}
                _ => {
                    return Err(MergeInvariantViolation::Untraceable {
                        label: group.label.clone(),
                        rank: member.rank,
                    });
                }
            }

            if !seen.insert(member.rank) {
                return Err(MergeInvariantViolation::Duplicated {
                    source_id: member.source_id.clone(),
                    rank: member.rank,
                });
            }

            if !group.text.contains(member.text.as_str()) {
                return Err(MergeInvariantViolation::Truncated {
                    label: group.label.clone(),
                });
            }
        }

        if group.is_merged() && !is_contiguous(&group.members) {
            return Err(MergeInvariantViolation::NonContiguous {
                label: group.label.clone(),
            });
        }
    }

    if let Some(missing) = input.iter().find(|candidate| !seen.contains(&candidate.rank)) {
        return Err(MergeInvariantViolation::Dropped {
            source_id: missing.source_id.clone(),
            rank: missing.rank,
        });
    }

    Ok(())
}

fn is_contiguous(members: &[Candidate]) -> bool {
    let Some(first) = members.first() else {
        return false;
    };
    let source = first.source();

    let mut keys = Vec::<i64>::with_capacity(members.len());
    for member in members {
        if member.source() != source {
            return false;
        }
        match member.resolved_sequence_key() {
            Some(key) => keys.push(key),
            None => return false,
        }
    }

    keys.sort_unstable();
    keys.windows(2).all(|pair| pair[0].checked_add(1) == Some(pair[1]))
}
