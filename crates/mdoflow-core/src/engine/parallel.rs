use super::error::EngineError;
#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Runs `f` on every item and collects the results in item order.
///
/// With more than one process and the `parallel` feature, items are spread over a pool of
/// `n_processes` workers and joined before returning. The first error wins.
pub(crate) fn fork_join<T, R, F>(
    items: &[T],
    n_processes: usize,
    f: F,
) -> Result<Vec<R>, EngineError>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> Result<R, EngineError> + Sync + Send,
{
    if n_processes <= 1 || items.len() <= 1 {
        return items.iter().map(f).collect();
    }

    #[cfg(feature = "parallel")]
    let results = {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_processes.min(items.len()))
            .build()
            .map_err(|e| EngineError::WorkerPool(e.to_string()))?;
        pool.install(|| items.par_iter().map(&f).collect())
    };

    #[cfg(not(feature = "parallel"))]
    let results = items.iter().map(f).collect();

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_keep_item_order() {
        let items: Vec<u64> = (0..32).collect();
        let squares = fork_join(&items, 4, |&x| Ok(x * x)).unwrap();
        assert_eq!(squares, items.iter().map(|x| x * x).collect::<Vec<_>>());
    }

    #[test]
    fn sequential_when_single_process() {
        let items = vec![1, 2, 3];
        let sums = fork_join(&items, 1, |&x| Ok(x + 1)).unwrap();
        assert_eq!(sums, vec![2, 3, 4]);
    }

    #[test]
    fn errors_propagate() {
        let items = vec![1, 2, 3];
        let result: Result<Vec<i32>, _> = fork_join(&items, 2, |&x| {
            if x == 2 {
                Err(EngineError::Internal("boom".into()))
            } else {
                Ok(x)
            }
        });
        assert!(matches!(result, Err(EngineError::Internal(msg)) if msg == "boom"));
    }
}
