use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{AlignmentError, Result},
    image::FrameImage,
};

use super::types::{CutOutcome, Frame};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Window {
    Since(DateTime<Utc>),
    /// Frames echoing this command epoch or a later one.
    Epoch(u64),
}

impl Window {
    pub fn contains(&self, frame: &Frame) -> bool {
        match self {
            Window::Since(reference) => frame.timestamp >= *reference,
            Window::Epoch(epoch) => frame.epoch.is_some_and(|e| e >= *epoch),
        }
    }
}

#[derive(Default)]
pub struct FrameBuffer {
    frames: Mutex<VecDeque<Frame>>,
    arrived: Notify,
    total_received: AtomicU64,
    ordering_violations: AtomicU64,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Frame>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, frame: Frame) {
        {
            let mut frames = self.lock();
            if let Some(newest) = frames.back() {
                if frame.timestamp < newest.timestamp {
                    self.ordering_violations.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "frame stamped {} arrived after {}, keeping it",
                        frame.timestamp, newest.timestamp
                    );
                }
            }
            frames.push_back(frame);
        }
        self.total_received.fetch_add(1, Ordering::Relaxed);
        self.arrived.notify_waiters();
    }

    pub fn cut(&self, reference: DateTime<Utc>) -> CutOutcome {
        let mut frames = self.lock();
        let before = frames.len();

        let newest = frames.iter().map(|f| f.timestamp).max();
        if matches!(newest, Some(newest) if newest < reference) {
            frames.clear();
            debug!("cut at {reference}: all {before} frames were stale");
            return CutOutcome::Stale(before);
        }

        frames.retain(|f| f.timestamp >= reference);
        CutOutcome::Trimmed(before - frames.len())
    }

    /// Drops every frame that does not echo `epoch` or a later one.
    pub fn cut_before_epoch(&self, epoch: u64) -> CutOutcome {
        let mut frames = self.lock();
        let before = frames.len();
        frames.retain(|f| f.epoch.is_some_and(|e| e >= epoch));
        if before > 0 && frames.is_empty() {
            CutOutcome::Stale(before)
        } else {
            CutOutcome::Trimmed(before - frames.len())
        }
    }

    pub fn clear(&self) -> usize {
        let mut frames = self.lock();
        let removed = frames.len();
        frames.clear();
        removed
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn count_in(&self, window: Window) -> usize {
        self.lock().iter().filter(|f| window.contains(f)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contents(&self) -> Vec<Frame> {
        self.lock().iter().cloned().collect()
    }

    /// The first `n` images of the window, oldest first.
    pub fn front(&self, window: Window, n: usize) -> Vec<FrameImage> {
        self.lock()
            .iter()
            .filter(|f| window.contains(f))
            .take(n)
            .map(|f| f.image.clone())
            .collect()
    }

    pub fn last(&self, n: usize) -> Vec<FrameImage> {
        let frames = self.lock();
        let skip = frames.len().saturating_sub(n);
        frames.iter().skip(skip).map(|f| f.image.clone()).collect()
    }

    pub fn newest(&self) -> Option<Frame> {
        self.lock().back().cloned()
    }

    /// Frames appended since creation, unaffected by cuts.
    pub fn total_received(&self) -> u64 {
        self.total_received.load(Ordering::Relaxed)
    }

    pub fn ordering_violations(&self) -> u64 {
        self.ordering_violations.load(Ordering::Relaxed)
    }

    pub async fn wait_for_count(
        &self,
        window: Window,
        n: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register before checking so an append in between is not missed.
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let count = self.count_in(window);
            if count >= n {
                return Ok(count);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(AlignmentError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(AlignmentError::Timeout {
                        waited: timeout,
                        expected: n,
                        received: self.count_in(window),
                    });
                }
                _ = &mut notified => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;
    use image::Luma;

    use super::*;
    use crate::image::Image;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    fn frame(seconds: i64) -> Frame {
        Frame::new(at(seconds), Image::<u16>::from_pixel(2, 2, Luma([seconds as u16])))
    }

    fn stamps(buffer: &FrameBuffer) -> Vec<i64> {
        buffer.contents().iter().map(|f| f.timestamp.timestamp()).collect()
    }

    #[test]
    fn test_cut_then_stale_cut() {
        let buffer = FrameBuffer::new();
        for t in 1..=5 {
            buffer.append(frame(t));
        }

        assert_eq!(buffer.cut(at(3)), CutOutcome::Trimmed(2));
        assert_eq!(stamps(&buffer), vec![3, 4, 5]);

        assert_eq!(buffer.cut(at(10)), CutOutcome::Stale(3));
        assert!(buffer.is_empty());
        assert_eq!(buffer.total_received(), 5);
    }

    #[test]
    fn test_cut_before_everything_is_noop() {
        let buffer = FrameBuffer::new();
        for t in 4..=6 {
            buffer.append(frame(t));
        }
        assert_eq!(buffer.cut(at(1)), CutOutcome::Trimmed(0));
        assert_eq!(stamps(&buffer), vec![4, 5, 6]);
        assert_eq!(buffer.cut(at(1)).removed(), 0);
        assert_eq!(FrameBuffer::new().cut(at(1)), CutOutcome::Trimmed(0));
    }

    #[test]
    fn test_out_of_order_frames_are_kept() {
        let buffer = FrameBuffer::new();
        buffer.append(frame(5));
        buffer.append(frame(3));
        assert_eq!(buffer.count(), 2);
        assert_eq!(buffer.ordering_violations(), 1);

        buffer.cut(at(4));
        assert_eq!(stamps(&buffer), vec![5]);
    }

    #[test]
    fn test_epoch_window() {
        let buffer = FrameBuffer::new();
        buffer.append(frame(1).with_epoch(1));
        buffer.append(frame(2));
        buffer.append(frame(3).with_epoch(2));
        buffer.append(frame(4).with_epoch(3));

        assert_eq!(buffer.count_in(Window::Epoch(2)), 2);
        assert_eq!(buffer.cut_before_epoch(2), CutOutcome::Trimmed(2));
        assert_eq!(stamps(&buffer), vec![3, 4]);
        assert_eq!(buffer.cut_before_epoch(9), CutOutcome::Stale(2));
    }

    #[test]
    fn test_front_and_last() {
        let buffer = FrameBuffer::new();
        for t in 1..=5 {
            buffer.append(frame(t));
        }
        let pixel = |img: &FrameImage| img.to_f32().get_pixel(0, 0)[0];

        let front: Vec<f32> = buffer.front(Window::Since(at(2)), 2).iter().map(pixel).collect();
        assert_eq!(front, vec![2.0, 3.0]);

        let last: Vec<f32> = buffer.last(2).iter().map(pixel).collect();
        assert_eq!(last, vec![4.0, 5.0]);
        assert_eq!(buffer.last(10).len(), 5);
        assert_eq!(buffer.newest().unwrap().timestamp, at(5));
    }

    #[tokio::test]
    async fn test_wait_wakes_on_append() {
        let buffer = Arc::new(FrameBuffer::new());
        let cancel = CancellationToken::new();

        let producer = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                for t in 1..=3 {
                    tokio::task::yield_now().await;
                    buffer.append(frame(t));
                }
            })
        };

        let count = buffer
            .wait_for_count(Window::Since(at(0)), 3, Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        assert_eq!(count, 3);
        producer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let buffer = FrameBuffer::new();
        buffer.append(frame(1));

        let err = buffer
            .wait_for_count(Window::Since(at(0)), 4, Duration::from_secs(2), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            AlignmentError::Timeout {
                expected, received, ..
            } => assert_eq!((expected, received), (4, 1)),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wait_observes_cancellation() {
        let buffer = FrameBuffer::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = buffer
            .wait_for_count(Window::Epoch(0), 1, Duration::from_secs(60), &cancel)
            .await;
        assert!(matches!(result, Err(AlignmentError::Cancelled)));
    }
}
