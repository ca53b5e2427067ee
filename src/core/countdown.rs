//! 可取消倒计时
//!
//! 单次计时器：每秒产出一次剩余秒数（duration-1 … 0），结束时恰好给出一个 Expiry。
//! 剩余 0 秒的 tick 之后仍有完整的一秒才到期，这一秒内的暂停/停止同样生效。
//! 丢弃句柄即取消。

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// 倒计时结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Elapsed,
    Cancelled,
}

/// 倒计时句柄
#[derive(Debug)]
pub struct CountdownHandle {
    token: CancellationToken,
    ticks: mpsc::Receiver<u32>,
    done: Option<oneshot::Receiver<Expiry>>,
}

/// 启动倒计时
///
/// 第 k 次 tick（剩余 duration-k）对齐到起点后 k-1 秒，到期对齐到起点后 duration 秒，
/// 处理延迟不会累积。
pub fn start(duration: u32) -> CountdownHandle {
    let token = CancellationToken::new();
    let (tick_tx, ticks) = mpsc::channel(duration as usize + 1);
    let (done_tx, done) = oneshot::channel();

    let timer_token = token.clone();
    tokio::spawn(async move {
        let started = Instant::now();
        let mut expiry = Expiry::Elapsed;
        for k in 1..=duration {
            let deadline = started + Duration::from_secs((k - 1) as u64);
            tokio::select! {
                biased;
                _ = timer_token.cancelled() => {
                    expiry = Expiry::Cancelled;
                    break;
                }
                _ = sleep_until(deadline) => {
                    let _ = tick_tx.try_send(duration - k);
                }
            }
        }
        if expiry == Expiry::Elapsed {
            tokio::select! {
                biased;
                _ = timer_token.cancelled() => expiry = Expiry::Cancelled,
                _ = sleep_until(started + Duration::from_secs(duration as u64)) => {}
            }
        }
        drop(tick_tx);
        let _ = done_tx.send(expiry);
    });

    CountdownHandle {
        token,
        ticks,
        done: Some(done),
    }
}

impl CountdownHandle {
    /// 取消倒计时，下一次 tick 之前生效
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// 下一个剩余秒数；计时结束（或取消）后返回 None
    pub async fn next_tick(&mut self) -> Option<u32> {
        self.ticks.recv().await
    }

    /// 等待计时结束
    pub async fn finish(mut self) -> Expiry {
        match self.done.take() {
            Some(done) => done.await.unwrap_or(Expiry::Cancelled),
            None => Expiry::Cancelled,
        }
    }
}

impl Drop for CountdownHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_down_to_zero() {
        let mut countdown = start(3);
        let mut seen = Vec::new();
        while let Some(remaining) = countdown.next_tick().await {
            seen.push(remaining);
        }
        assert_eq!(seen, vec![2, 1, 0]);
        assert_eq!(countdown.finish().await, Expiry::Elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_spacing_is_one_second() {
        let begin = Instant::now();
        let mut countdown = start(2);
        assert_eq!(countdown.next_tick().await, Some(1));
        assert_eq!(begin.elapsed(), Duration::ZERO);
        assert_eq!(countdown.next_tick().await, Some(0));
        assert_eq!(begin.elapsed(), Duration::from_secs(1));
        assert_eq!(countdown.next_tick().await, None);
        assert_eq!(begin.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_last_tick_is_cancelled() {
        let mut countdown = start(2);
        countdown.next_tick().await;
        assert_eq!(countdown.next_tick().await, Some(0));
        tokio::time::sleep(Duration::from_millis(500)).await;
        countdown.cancel();
        assert_eq!(countdown.next_tick().await, None);
        assert_eq!(countdown.finish().await, Expiry::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_ticks() {
        let mut countdown = start(5);
        assert_eq!(countdown.next_tick().await, Some(4));
        countdown.cancel();
        assert_eq!(countdown.next_tick().await, None);
        assert_eq!(countdown.finish().await, Expiry::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_duration_elapses_immediately() {
        let mut countdown = start(0);
        assert_eq!(countdown.next_tick().await, None);
        assert_eq!(countdown.finish().await, Expiry::Elapsed);
    }
}
