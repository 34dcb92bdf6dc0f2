use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

/// Runs `task` over every item with at most `limit` in flight and returns
/// results in input order. A failing or panicking item only affects its own
/// slot.
pub fn fan_out<T, R, E, F>(limit: usize, items: Vec<T>, task: F) -> Vec<Result<R, E>>
where
    T: Send,
    R: Send,
    E: Send + From<String>,
    F: Fn(usize, T) -> Result<R, E> + Sync,
{
    let total = items.len();
    if total == 0 {
        return Vec::new();
    }
    let workers = limit.clamp(1, total);
    let queue = Mutex::new(items.into_iter().enumerate());
    let slots: Vec<Mutex<Option<Result<R, E>>>> = (0..total).map(|_| Mutex::new(None)).collect();
    let next_worker = AtomicUsize::new(0);

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                let worker = next_worker.fetch_add(1, Ordering::Relaxed);
                loop {
                    let next = match queue.lock() {
                        Ok(mut queue) => queue.next(),
                        Err(poisoned) => poisoned.into_inner().next(),
                    };
                    let Some((idx, item)) = next else {
                        break;
                    };
                    let result = panic::catch_unwind(AssertUnwindSafe(|| task(idx, item)))
                        .unwrap_or_else(|panic| Err(E::from(panic_message(worker, &*panic))));
                    if let Ok(mut slot) = slots[idx].lock() {
                        *slot = Some(result);
                    }
                }
            });
        }
    });

    slots
        .into_iter()
        .map(|slot| {
            slot.into_inner()
                .ok()
                .flatten()
                .unwrap_or_else(|| Err(E::from("task produced no result".to_string())))
        })
        .collect()
}

fn panic_message(worker: usize, panic: &(dyn std::any::Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|value| value.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("worker {worker} task panicked: {detail}")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::fan_out;

    #[test]
    fn preserves_input_order() {
        let items = (0..20u64).collect::<Vec<_>>();
        let results = fan_out(4, items, |_, value| -> Result<u64, String> {
            // Later items finish first.
            thread::sleep(Duration::from_millis(20 - value));
            Ok(value * 10)
        });
        let values = results.into_iter().map(Result::unwrap_or_default).collect::<Vec<_>>();
        assert_eq!(values, (0..20u64).map(|value| value * 10).collect::<Vec<_>>());
    }

    #[test]
    fn never_exceeds_limit() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let results = fan_out(3, (0..12).collect(), |_, _: i32| -> Result<(), String> {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(15));
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(results.len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn failures_stay_in_their_slot() {
        let results = fan_out(2, vec!["a", "boom", "c"], |idx, item| {
            if item == "boom" {
                Err(format!("item {idx} failed"))
            } else {
                Ok(item.to_uppercase())
            }
        });
        assert_eq!(results[0], Ok("A".to_string()));
        assert_eq!(results[1], Err("item 1 failed".to_string()));
        assert_eq!(results[2], Ok("C".to_string()));
    }

    #[test]
    fn panics_become_errors() {
        let results = fan_out(2, vec![1, 2, 3], |_, value: i32| -> Result<i32, String> {
            if value == 2 {
                panic!("bad item");
            }
            Ok(value)
        });
        assert_eq!(results[0], Ok(1));
        assert!(results[1]
            .as_ref()
            .err()
            .is_some_and(|message| message.contains("bad item")));
        assert_eq!(results[2], Ok(3));
    }

    #[test]
    fn empty_input_and_zero_limit() {
        let none = fan_out(4, Vec::<u8>::new(), |_, value| -> Result<u8, String> { Ok(value) });
        assert!(none.is_empty());
        let single = fan_out(0, vec![7u8], |_, value| -> Result<u8, String> { Ok(value) });
        assert_eq!(single, vec![Ok(7)]);
    }
}
