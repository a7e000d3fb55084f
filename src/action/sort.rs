use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Topological order of `0..keys.len()`.
///
/// `deps[i]` lists the items that must precede item `i`. Among items whose dependencies are all placed, the one with
/// the smallest key goes first, which makes the order stable for equal keys as long as keys are unique. Returns the
/// items left unplaced when the dependencies contain a cycle.
pub(crate) fn dependency_order<K: Ord + Copy>(keys: &[K], deps: &[Vec<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let count = keys.len();
    let mut pending = vec![0usize; count];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
    for (item, item_deps) in deps.iter().enumerate() {
        for &dep in item_deps {
            if dep != item && dep < count {
                pending[item] += 1;
                dependents[dep].push(item);
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<(K, usize)>> = pending
        .iter()
        .enumerate()
        .filter(|(_, p)| **p == 0)
        .map(|(i, _)| Reverse((keys[i], i)))
        .collect();
    let mut order = Vec::with_capacity(count);
    while let Some(Reverse((_, item))) = ready.pop() {
        order.push(item);
        for &next in &dependents[item] {
            pending[next] -= 1;
            if pending[next] == 0 {
                ready.push(Reverse((keys[next], next)));
            }
        }
    }

    if order.len() == count {
        Ok(order)
    }
    else {
        Err((0..count).filter(|i| pending[*i] > 0).collect())
    }
}
