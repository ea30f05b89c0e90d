//! Scoped worker fan-out for CPU bound candidate fits.

use std::sync::mpsc;
use std::thread;

use parking_lot::Mutex;

/// Run `job` over every item on up to `workers` threads.
///
/// Results come back in input order whatever order the workers finish in.
/// With `workers <= 1` everything runs on the calling thread.
pub fn fan_out<T, R, F>(items: Vec<T>, workers: usize, job: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let total = items.len();
    if workers <= 1 || total <= 1 {
        return items.into_iter().map(job).collect();
    }

    let (job_tx, job_rx) = mpsc::channel::<(usize, T)>();
    for pair in items.into_iter().enumerate() {
        // Receiver lives until the scope below ends.
        let _ = job_tx.send(pair);
    }
    drop(job_tx);

    let queue = Mutex::new(job_rx);
    let (out_tx, out_rx) = mpsc::channel::<(usize, R)>();
    thread::scope(|scope| {
        for _ in 0..workers.min(total) {
            let out_tx = out_tx.clone();
            let queue = &queue;
            let job = &job;
            scope.spawn(move || loop {
                let next = queue.lock().recv();
                match next {
                    Ok((idx, item)) => {
                        if out_tx.send((idx, job(item))).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            });
        }
    });
    drop(out_tx);

    let mut slots: Vec<Option<R>> = (0..total).map(|_| None).collect();
    for (idx, result) in out_rx {
        slots[idx] = Some(result);
    }
    slots.into_iter().flatten().collect()
}
