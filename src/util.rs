use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// The largest single sleep taken by responsive_sleep. Periodic loops observe
/// a shutdown within this bound regardless of their tick interval.
const MAX_NAP: Duration = Duration::from_millis(250);

/// Sleeps for the given duration while the running flag holds, waking in
/// increments of at most 250 ms to observe shutdown. Returns false if the
/// flag was cleared before the full duration elapsed.
pub fn responsive_sleep(running: &AtomicBool, duration: Duration) -> bool {
    let mut remaining = duration;
    while !remaining.is_zero() {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let nap = remaining.min(MAX_NAP);
        std::thread::sleep(nap);
        remaining -= nap;
    }
    running.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn sleeps_full_duration() {
        let running = AtomicBool::new(true);
        let start = std::time::Instant::now();
        assert!(responsive_sleep(&running, Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn wakes_on_shutdown() {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            flag.store(false, Ordering::SeqCst);
        });
        let start = std::time::Instant::now();
        assert!(!responsive_sleep(&running, Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }
}
