//! Dotted-child ordering.
//!
//! Ids of the form `<prefix>.<number>` sort numerically within their common
//! prefix while every non-dotted id keeps its original position. The pass
//! extracts the subsequence of positions holding dotted ids, sorts those
//! items by `(prefix, numeric suffix)` using a natural compare for the
//! prefix, and reinserts them into the same positions.

use std::cmp::Ordering;

use super::Task;

/// Split an id into `(prefix, numeric suffix)` when it has the dotted-child
/// shape. The suffix must be non-empty, all ASCII digits, and fit in u64.
fn split_dotted(id: &str) -> Option<(&str, u64)> {
    let (prefix, suffix) = id.rsplit_once('.')?;
    if prefix.is_empty() || suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let number = suffix.parse::<u64>().ok()?;
    Some((prefix, number))
}

/// Natural string compare: digit runs compare as numbers, everything else
/// compares case-insensitively byte by byte. Ties on the case-folded form
/// fall back to the raw bytes so the ordering is total and repeatable.
fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut ai = a.char_indices().peekable();
    let mut bi = b.char_indices().peekable();

    loop {
        match (ai.peek().copied(), bi.peek().copied()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some((apos, ac)), Some((bpos, bc))) => {
                if ac.is_ascii_digit() && bc.is_ascii_digit() {
                    let a_run = digit_run(a, apos);
                    let b_run = digit_run(b, bpos);
                    let a_num = a_run.trim_start_matches('0');
                    let b_num = b_run.trim_start_matches('0');
                    let by_num = a_num
                        .len()
                        .cmp(&b_num.len())
                        .then_with(|| a_num.cmp(b_num));
                    if by_num != Ordering::Equal {
                        return by_num;
                    }
                    for _ in 0..a_run.len() {
                        ai.next();
                    }
                    for _ in 0..b_run.len() {
                        bi.next();
                    }
                } else {
                    let af = ac.to_lowercase().next().unwrap_or(ac);
                    let bf = bc.to_lowercase().next().unwrap_or(bc);
                    match af.cmp(&bf) {
                        Ordering::Equal => {
                            ai.next();
                            bi.next();
                        }
                        other => return other,
                    }
                }
            }
        }
    }
}

fn digit_run(s: &str, start: usize) -> &str {
    let rest = &s[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    &rest[..end]
}

/// Apply the dotted-child ordering pass in place.
pub fn apply_dotted_child_order(tasks: &mut Vec<Task>) {
    let dotted_positions: Vec<usize> = tasks
        .iter()
        .enumerate()
        .filter(|(_, t)| split_dotted(&t.id).is_some())
        .map(|(i, _)| i)
        .collect();

    if dotted_positions.len() < 2 {
        return;
    }

    let mut dotted: Vec<Task> = dotted_positions
        .iter()
        .map(|&i| tasks[i].clone())
        .collect();

    dotted.sort_by(|a, b| {
        let (ap, an) = split_dotted(&a.id).expect("filtered to dotted ids");
        let (bp, bn) = split_dotted(&b.id).expect("filtered to dotted ids");
        natural_cmp(ap, bp).then(an.cmp(&bn))
    });

    for (slot, task) in dotted_positions.into_iter().zip(dotted) {
        tasks[slot] = task;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(tasks: &[Task]) -> Vec<&str> {
        tasks.iter().map(|t| t.id.as_str()).collect()
    }

    fn make(idlist: &[&str]) -> Vec<Task> {
        idlist.iter().map(|id| Task::new(id, id)).collect()
    }

    #[test]
    fn sorts_dotted_children_numerically() {
        let mut tasks = make(&["a.10", "a.2", "a.1"]);
        apply_dotted_child_order(&mut tasks);
        assert_eq!(ids(&tasks), ["a.1", "a.2", "a.10"]);
    }

    #[test]
    fn non_dotted_ids_keep_positions() {
        let mut tasks = make(&["x.3", "plain", "x.1", "other", "x.2"]);
        apply_dotted_child_order(&mut tasks);
        assert_eq!(ids(&tasks), ["x.1", "plain", "x.2", "other", "x.3"]);
    }

    #[test]
    fn groups_by_prefix_before_suffix() {
        let mut tasks = make(&["b.1", "a.2", "b.2", "a.1"]);
        apply_dotted_child_order(&mut tasks);
        assert_eq!(ids(&tasks), ["a.1", "a.2", "b.1", "b.2"]);
    }

    #[test]
    fn prefix_compares_numerically() {
        // "task2" < "task10" under natural compare.
        let mut tasks = make(&["task10.1", "task2.1"]);
        apply_dotted_child_order(&mut tasks);
        assert_eq!(ids(&tasks), ["task2.1", "task10.1"]);
    }

    #[test]
    fn idempotent() {
        let mut tasks = make(&["c.2", "alpha", "c.1", "b.9", "b.10"]);
        apply_dotted_child_order(&mut tasks);
        let first = ids(&tasks)
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        apply_dotted_child_order(&mut tasks);
        assert_eq!(ids(&tasks), first);
    }

    #[test]
    fn ids_without_numeric_suffix_are_not_dotted() {
        let mut tasks = make(&["a.final", "a.2", "a.1"]);
        apply_dotted_child_order(&mut tasks);
        // "a.final" stays put; only the two numeric children reorder.
        assert_eq!(ids(&tasks), ["a.final", "a.1", "a.2"]);
    }

    #[test]
    fn single_dotted_id_is_untouched() {
        let mut tasks = make(&["z.1", "plain"]);
        apply_dotted_child_order(&mut tasks);
        assert_eq!(ids(&tasks), ["z.1", "plain"]);
    }

    #[test]
    fn natural_cmp_basics() {
        assert_eq!(natural_cmp("abc", "abc"), Ordering::Equal);
        assert_eq!(natural_cmp("a2", "a10"), Ordering::Less);
        assert_eq!(natural_cmp("A1", "a2"), Ordering::Less);
        assert_eq!(natural_cmp("a01", "a1"), Ordering::Less);
    }
}
