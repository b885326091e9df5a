//! Equivalence-class grouping for objects without a total order.
//!
//! The comparator only needs to be reflexive and symmetric. When it is not
//! transitive (near-duplicate structures within a tolerance, say) the result
//! is the connected components of the pairs it reports equal.

/// Label every item so that equal labels mean "transitively connected".
///
/// Labels are dense (`0..k`) and assigned in order of first appearance.
/// Every unordered pair whose labels differ at the time it is visited is
/// compared once, so the comparator runs at most `n(n-1)/2` times.
pub fn group<T, F>(items: &[T], mut equal: F) -> Vec<usize>
where
    F: FnMut(&T, &T) -> bool,
{
    let n = items.len();
    let mut labels: Vec<usize> = (0..n).collect();
    let mut classes = n;

    for i in 0..n {
        for j in (i + 1)..n {
            if labels[i] == labels[j] {
                continue;
            }
            if equal(&items[i], &items[j]) {
                let (keep, drop) = if labels[i] < labels[j] {
                    (labels[i], labels[j])
                } else {
                    (labels[j], labels[i])
                };
                for label in labels.iter_mut() {
                    if *label == drop {
                        *label = keep;
                    }
                }
                classes -= 1;
            }
        }
    }

    // Relabel densely in first-appearance order.
    let mut dense = vec![usize::MAX; n];
    let mut next = 0;
    for label in labels.iter_mut() {
        if dense[*label] == usize::MAX {
            dense[*label] = next;
            next += 1;
        }
        *label = dense[*label];
    }
    debug_assert_eq!(next, classes);
    labels
}

/// Partition `items` into equivalence classes, ordered by first member.
pub fn group_into_classes<T, F>(items: Vec<T>, equal: F) -> Vec<Vec<T>>
where
    F: FnMut(&T, &T) -> bool,
{
    let labels = group(&items, equal);
    let count = labels.iter().max().map_or(0, |m| m + 1);
    let mut classes: Vec<Vec<T>> = (0..count).map(|_| Vec::new()).collect();
    for (item, label) in items.into_iter().zip(labels) {
        classes[label].push(item);
    }
    classes
}
