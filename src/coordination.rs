//! 워커 종료 조율
//!
//! - `Barrier`: 2단계 정지/확인 랑데부 (송신측)
//! - `Cancellation`: 전송 전체 취소 신호 (송수신 공통)

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

/// 정지 배리어 (소유자측)
pub struct Barrier {
    stops: Vec<oneshot::Sender<()>>,
    done_rx: mpsc::Receiver<usize>,
    workers: usize,
}

/// 워커측 신호
pub struct WorkerSignal {
    conn_id: usize,
    stop: oneshot::Receiver<()>,
    observed: Option<bool>,
    done: mpsc::Sender<usize>,
}

/// N개 워커용 배리어 생성
pub fn barrier(workers: usize) -> (Barrier, Vec<WorkerSignal>) {
    let (done_tx, done_rx) = mpsc::channel(workers.max(1));
    let mut stops = Vec::with_capacity(workers);
    let mut signals = Vec::with_capacity(workers);

    for conn_id in 0..workers {
        let (stop_tx, stop_rx) = oneshot::channel();
        stops.push(stop_tx);
        signals.push(WorkerSignal {
            conn_id,
            stop: stop_rx,
            observed: None,
            done: done_tx.clone(),
        });
    }

    (
        Barrier {
            stops,
            done_rx,
            workers,
        },
        signals,
    )
}

impl Barrier {
    /// 모든 워커에 정지 토큰을 보내고 N개의 완료 확인을 기다림
    ///
    /// 값으로 소비되므로 배리어당 한 번만 호출 가능.
    /// 반환값은 받은 완료 확인 수 (모든 워커 신호가 drop되면 N보다 작을 수 있음).
    pub async fn stop(mut self) -> usize {
        for stop in self.stops.drain(..) {
            // 이미 종료한 워커는 무시
            let _ = stop.send(());
        }

        let mut acknowledged = 0;
        while acknowledged < self.workers {
            match self.done_rx.recv().await {
                Some(conn_id) => {
                    acknowledged += 1;
                    debug!("워커 {} 완료 확인 ({}/{})", conn_id, acknowledged, self.workers);
                }
                None => break,
            }
        }
        acknowledged
    }
}

impl WorkerSignal {
    pub fn conn_id(&self) -> usize {
        self.conn_id
    }

    /// 정지 토큰 대기
    ///
    /// 정지 토큰이면 true, 배리어가 정지 없이 drop되었으면 false.
    /// select! 안에서 반복 호출해도 안전하다.
    pub async fn should_stop(&mut self) -> bool {
        if let Some(stop) = self.observed {
            return stop;
        }
        let stop = (&mut self.stop).await.is_ok();
        self.observed = Some(stop);
        stop
    }

    /// 완료 확인 (정확히 한 번)
    pub fn done(self) {
        // 채널 용량이 워커 수이므로 가득 찰 수 없음
        let _ = self.done.try_send(self.conn_id);
    }
}

/// 전송 취소 신호
#[derive(Clone)]
pub struct Cancellation {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// 취소 요청
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// 취소될 때까지 대기
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // 송신자를 self가 들고 있으므로 닫히지 않음
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_waits_for_all_workers() {
        let (barrier, signals) = barrier(3);
        let finished = Arc::new(AtomicUsize::new(0));

        for mut signal in signals {
            let finished = finished.clone();
            tokio::spawn(async move {
                assert!(signal.should_stop().await);
                tokio::time::sleep(Duration::from_millis(5 * signal.conn_id() as u64)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                signal.done();
            });
        }

        assert_eq!(barrier.stop().await, 3);
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_early_done_is_counted() {
        let (barrier, signals) = barrier(2);
        let mut signals = signals.into_iter();

        // 에러로 먼저 종료한 워커
        signals.next().unwrap().done();

        let mut late = signals.next().unwrap();
        tokio::spawn(async move {
            late.should_stop().await;
            late.done();
        });

        assert_eq!(barrier.stop().await, 2);
    }

    #[tokio::test]
    async fn test_dropped_signal_does_not_hang() {
        let (barrier, signals) = barrier(2);
        drop(signals);
        assert_eq!(barrier.stop().await, 0);
    }

    #[tokio::test]
    async fn test_should_stop_is_repeatable() {
        let (barrier, mut signals) = barrier(1);
        let mut signal = signals.pop().unwrap();

        let stopper = tokio::spawn(barrier.stop());
        assert!(signal.should_stop().await);
        assert!(signal.should_stop().await);
        signal.done();
        assert_eq!(stopper.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_should_stop_false_when_barrier_dropped() {
        let (barrier, mut signals) = barrier(1);
        drop(barrier);
        assert!(!signals[0].should_stop().await);
    }

    #[tokio::test]
    async fn test_cancellation() {
        let cancel = Cancellation::new();
        assert!(!cancel.is_cancelled());

        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move { cancel.cancelled().await })
        };

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(cancel.is_cancelled());

        // 이미 취소된 뒤에도 즉시 반환
        cancel.cancelled().await;
    }
}
