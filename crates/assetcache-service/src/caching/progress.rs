use std::sync::{Arc, Mutex};

pub(crate) type ProgressCallback = Box<dyn Fn(f32) + Send + Sync>;

/// Multicasts progress reports from one load task to every caller that asked
/// for them.
///
/// Callers can subscribe at any point while the record is alive; a record's
/// broadcaster is shared between the record table and the load task.
#[derive(Default)]
pub(crate) struct ProgressBroadcast {
    callbacks: Mutex<Vec<ProgressCallback>>,
}

impl ProgressBroadcast {
    pub(crate) fn subscribe(&self, callback: ProgressCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }

    pub(crate) fn report(&self, value: f32) {
        let callbacks = self.callbacks.lock().unwrap();
        for callback in callbacks.iter() {
            callback(value);
        }
    }
}

/// Aggregates per-item progress of a batch load into a single signal.
///
/// The reported value is the arithmetic mean of the most recent per-item
/// values; items that have not reported yet count as `0`.
pub(crate) struct BatchProgress {
    slots: Mutex<Vec<f32>>,
    callback: ProgressCallback,
}

impl BatchProgress {
    pub(crate) fn new(len: usize, callback: ProgressCallback) -> Arc<Self> {
        Arc::new(BatchProgress {
            slots: Mutex::new(vec![0.0; len]),
            callback,
        })
    }

    /// Returns the progress callback for the item at `index`.
    pub(crate) fn subscriber(self: &Arc<Self>, index: usize) -> ProgressCallback {
        let this = Arc::clone(self);
        Box::new(move |value| this.report(index, value))
    }

    fn report(&self, index: usize, value: f32) {
        let mean = {
            let mut slots = self.slots.lock().unwrap();
            slots[index] = value;
            slots.iter().sum::<f32>() / slots.len() as f32
        };
        (self.callback)(mean);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_mean_counts_silent_items_as_zero() {
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let reported = Arc::clone(&reported);
            Box::new(move |v: f32| reported.lock().unwrap().push(v))
        };

        let batch = BatchProgress::new(2, sink);
        let first = batch.subscriber(0);
        let second = batch.subscriber(1);

        first(1.0);
        second(0.5);

        let reported = reported.lock().unwrap();
        assert_eq!(reported.as_slice(), &[0.5, 0.75]);
    }
}
