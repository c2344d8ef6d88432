//! Server heartbeat.
//!
//! A dedicated thread pushes a [`WorkItem::Tick`] onto the command
//! worklist at a fixed interval, so staleness sweeps and the periodic
//! log pulse run on the worker pool like everything else. The beat can
//! be paused and resumed at runtime; control commands arrive on a small
//! queue the thread also uses as its interval timer.

use crate::command::WorkItem;
use crate::error::{Error, Result};
use crate::sync::{SyncQueue, Worklist};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

enum Ctrl {
    Pause,
    Resume,
    Stop,
}

pub struct Heartbeat {
    ctrl: Arc<SyncQueue<Ctrl>>,
    beats: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl Heartbeat {
    /// Start beating. The first tick is emitted immediately.
    pub fn start(interval: Duration, worklist: Worklist<WorkItem>) -> Result<Self> {
        let ctrl = Arc::new(SyncQueue::new());
        let beats = Arc::new(AtomicU64::new(0));

        let thread_ctrl = Arc::clone(&ctrl);
        let thread_beats = Arc::clone(&beats);
        let thread = thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || beat_loop(interval, worklist, thread_ctrl, thread_beats))
            .map_err(|e| Error::Other(format!("failed to spawn heartbeat thread: {}", e)))?;

        Ok(Self {
            ctrl,
            beats,
            thread: Some(thread),
        })
    }

    /// Suspend ticking until [`resume`](Self::resume).
    pub fn pause(&self) {
        let _ = self.ctrl.push_back(Ctrl::Pause);
    }

    pub fn resume(&self) {
        let _ = self.ctrl.push_back(Ctrl::Resume);
    }

    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }

    /// Stop the beat and join its thread.
    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.ctrl.push_back(Ctrl::Stop);
            self.ctrl.close();
            let _ = thread.join();
            log::info!("heartbeat stopped after {} beat(s)", self.beats());
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

fn beat_loop(
    interval: Duration,
    worklist: Worklist<WorkItem>,
    ctrl: Arc<SyncQueue<Ctrl>>,
    beats: Arc<AtomicU64>,
) {
    loop {
        let beat = beats.fetch_add(1, Ordering::Relaxed) + 1;
        if worklist.push(WorkItem::Tick { beat }).is_err() {
            // Worklist gone, nothing left to beat for.
            break;
        }

        // The control queue doubles as the interval timer.
        match ctrl.pop_front_timeout(interval) {
            Ok(None) | Ok(Some(Ctrl::Resume)) => {}
            Ok(Some(Ctrl::Stop)) | Err(_) => break,
            Ok(Some(Ctrl::Pause)) => {
                log::info!("heartbeat paused");
                loop {
                    match ctrl.pop_front() {
                        Ok(Ctrl::Resume) => {
                            log::info!("heartbeat resumed");
                            break;
                        }
                        Ok(Ctrl::Pause) => {}
                        Ok(Ctrl::Stop) | Err(_) => return,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_ticks_arrive_with_increasing_beat_numbers() {
        let worklist: Worklist<WorkItem> = Worklist::new("ticks");
        let mut hb = Heartbeat::start(Duration::from_millis(20), worklist.clone()).unwrap();

        let first = worklist.pop_timeout(Duration::from_secs(2)).unwrap().unwrap();
        let second = worklist.pop_timeout(Duration::from_secs(2)).unwrap().unwrap();
        match (first, second) {
            (WorkItem::Tick { beat: a }, WorkItem::Tick { beat: b }) => {
                assert_eq!(a, 1);
                assert_eq!(b, 2);
            }
            other => panic!("unexpected work items: {:?}", other),
        }
        hb.stop();
        assert!(hb.beats() >= 2);
    }

    #[test]
    fn test_pause_suppresses_ticks_until_resume() {
        let worklist: Worklist<WorkItem> = Worklist::new("ticks");
        let mut hb = Heartbeat::start(Duration::from_millis(10), worklist.clone()).unwrap();
        hb.pause();

        // Drain whatever beat before the pause took hold.
        while worklist.pop_timeout(Duration::from_millis(100)).unwrap().is_some() {}
        assert!(worklist.pop_timeout(Duration::from_millis(150)).unwrap().is_none());

        hb.resume();
        assert!(worklist.pop_timeout(Duration::from_secs(2)).unwrap().is_some());
        hb.stop();
    }

    #[test]
    fn test_stop_joins_promptly() {
        let worklist: Worklist<WorkItem> = Worklist::new("ticks");
        let mut hb = Heartbeat::start(Duration::from_secs(300), worklist).unwrap();
        let started = Instant::now();
        hb.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
