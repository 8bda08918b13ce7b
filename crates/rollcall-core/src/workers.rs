//! Photo-level worker pool.
//!
//! Layout: `caller → jobs → [worker; n] → results → caller`.
//!
//! Every worker owns its own locator built from the factory, so locators
//! never need to be shared. Results come back tagged with their input index
//! and are returned in input order regardless of completion order.

use crate::detector::{DetectorError, FaceLocator, LocatorFactory};

/// Run `work` over `items` on up to `workers` threads, preserving order.
///
/// All locators are built before any thread starts; a factory failure
/// aborts the whole run.
pub fn map_with_locator<T, R, F>(
    items: Vec<T>,
    workers: usize,
    factory: &LocatorFactory,
    work: F,
) -> Result<Vec<R>, DetectorError>
where
    T: Send,
    R: Send,
    F: Fn(&mut dyn FaceLocator, T) -> R + Sync,
{
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let count = items.len();
    let n = workers.clamp(1, count);
    let locators = (0..n).map(|_| factory()).collect::<Result<Vec<_>, _>>()?;

    let (job_tx, job_rx) = crossbeam_channel::unbounded::<(usize, T)>();
    let (result_tx, result_rx) = crossbeam_channel::unbounded::<(usize, R)>();
    for job in items.into_iter().enumerate() {
        // Receiver is alive until the scope below ends.
        let _ = job_tx.send(job);
    }
    drop(job_tx);

    let work = &work;
    std::thread::scope(|scope| {
        for mut locator in locators {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                for (index, item) in job_rx {
                    let out = work(locator.as_mut(), item);
                    if result_tx.send((index, out)).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(result_tx);

    let mut slots: Vec<Option<R>> = (0..count).map(|_| None).collect();
    for (index, out) in result_rx {
        slots[index] = Some(out);
    }
    tracing::debug!(jobs = count, workers = n, "worker pool drained");
    Ok(slots.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectionParams;
    use crate::types::BoundingBox;
    use image::GrayImage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct NullLocator;

    impl FaceLocator for NullLocator {
        fn detect(
            &mut self,
            _: &GrayImage,
            _: &DetectionParams,
        ) -> Result<Vec<BoundingBox>, DetectorError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_results_keep_input_order() {
        let factory: Box<LocatorFactory> =
            Box::new(|| Ok(Box::new(NullLocator) as Box<dyn FaceLocator>));
        let items: Vec<u64> = (0..50).collect();
        let out = map_with_locator(items, 4, &factory, |_, i| {
            // Later items finish first.
            std::thread::sleep(std::time::Duration::from_micros(50 - i));
            i * 2
        })
        .unwrap();
        assert_eq!(out, (0..50).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_one_locator_per_worker() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let counting: Box<LocatorFactory> = Box::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(Box::new(NullLocator) as Box<dyn FaceLocator>)
        });
        let out = map_with_locator(vec![1, 2, 3], 8, &counting, |_, x| x).unwrap();
        assert_eq!(out, vec![1, 2, 3]);
        assert_eq!(built.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_factory_failure_aborts() {
        let factory: Box<LocatorFactory> =
            Box::new(|| Err(DetectorError::ModelNotFound("det_10g.onnx".into())));
        let err = map_with_locator(vec![1], 2, &factory, |_, x: i32| x).unwrap_err();
        assert!(matches!(err, DetectorError::ModelNotFound(_)));
    }

    #[test]
    fn test_empty_input_builds_nothing() {
        let factory: Box<LocatorFactory> =
            Box::new(|| Err(DetectorError::ModelNotFound("unused".into())));
        let out: Vec<i32> = map_with_locator(Vec::new(), 2, &factory, |_, x: i32| x).unwrap();
        assert!(out.is_empty());
    }
}
