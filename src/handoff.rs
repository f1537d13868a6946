//! 무버퍼 세그먼트 인계 채널
//!
//! 유휴 워커가 자신의 oneshot 슬롯을 준비 큐에 올리고, 공급자는 준비된 슬롯 하나에
//! 세그먼트를 직접 넘긴다. 공급자의 send는 어떤 워커가 받을 준비가 될 때까지 대기하므로
//! 느린 연결에는 자연히 세그먼트가 덜 배분된다.

use tokio::sync::{mpsc, oneshot};

use crate::segment::Segment;
use crate::{Error, Result};

type Slot = oneshot::Sender<Segment>;

/// 공급자측
pub struct HandoffSender {
    ready_rx: mpsc::Receiver<Slot>,
}

/// 워커측 (워커마다 clone)
///
/// 게시한 슬롯은 `recv` future가 drop되어도 유지되므로 이미 채워진 세그먼트를 잃지 않는다.
pub struct HandoffReceiver {
    ready_tx: mpsc::Sender<Slot>,
    pending: Option<oneshot::Receiver<Segment>>,
}

impl Clone for HandoffReceiver {
    fn clone(&self) -> Self {
        Self {
            ready_tx: self.ready_tx.clone(),
            pending: None,
        }
    }
}

/// 인계 채널 생성
pub fn handoff(workers: usize) -> (HandoffSender, HandoffReceiver) {
    let (ready_tx, ready_rx) = mpsc::channel(workers.max(1));
    (
        HandoffSender { ready_rx },
        HandoffReceiver {
            ready_tx,
            pending: None,
        },
    )
}

impl HandoffSender {
    /// 유휴 워커에게 세그먼트 인계
    ///
    /// 준비 슬롯의 워커가 이미 떠났으면 다음 슬롯으로 재시도.
    /// 모든 워커가 종료하면 `Error::ChannelError`.
    pub async fn send(&mut self, mut segment: Segment) -> Result<()> {
        loop {
            let slot = self.ready_rx.recv().await.ok_or(Error::ChannelError)?;
            match slot.send(segment) {
                Ok(()) => return Ok(()),
                Err(returned) => segment = returned,
            }
        }
    }
}

impl HandoffReceiver {
    /// 다음 세그먼트 수신
    ///
    /// 공급자가 drop되면 None. select! 안에서 drop되어도 슬롯은 남아 있어
    /// 다음 호출이나 `take_pending`에서 같은 슬롯을 이어서 기다린다.
    pub async fn recv(&mut self) -> Option<Segment> {
        if self.pending.is_none() {
            let (slot, rx) = oneshot::channel();
            self.ready_tx.send(slot).await.ok()?;
            self.pending = Some(rx);
        }

        let rx = self.pending.as_mut()?;
        let segment = rx.await.ok();
        self.pending = None;
        segment
    }

    /// 게시한 슬롯을 닫고 이미 인계된 세그먼트가 있으면 반환
    ///
    /// 닫힌 뒤의 send는 실패하므로 공급자는 세그먼트를 돌려받아 다른 워커로 넘긴다.
    pub fn take_pending(&mut self) -> Option<Segment> {
        let mut rx = self.pending.take()?;
        rx.close();
        rx.try_recv().ok()
    }
}
