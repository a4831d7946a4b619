//! Single-slot mailbox
//!
//! A rendezvous cell with the fixed states Idle → RequestReady →
//! ResponseReady | Error, one producer and one consumer, and at most one
//! parked waiter per side. The shell's command loop and the network
//! bridge both hand work across the sync/async boundary through this.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

enum Slot<Req, Resp> {
    Idle,
    Request(Req),
    Response(Resp),
    Error(String),
    Closed,
}

struct Inner<Req, Resp> {
    slot: Slot<Req, Resp>,
    request_waker: Option<Waker>,
    response_waker: Option<Waker>,
}

/// One mailbox; clones share the slot.
pub struct Mailbox<Req, Resp> {
    inner: Rc<RefCell<Inner<Req, Resp>>>,
}

impl<Req, Resp> Clone for Mailbox<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Req, Resp> Mailbox<Req, Resp> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                slot: Slot::Idle,
                request_waker: None,
                response_waker: None,
            })),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.inner.borrow().slot, Slot::Idle)
    }

    /// Hand a request to the consumer. Fails when the previous exchange
    /// has not completed.
    pub fn post_request(&self, req: Req) -> Result<(), &'static str> {
        let mut inner = self.inner.borrow_mut();
        match inner.slot {
            Slot::Idle => {
                inner.slot = Slot::Request(req);
                if let Some(waker) = inner.request_waker.take() {
                    waker.wake();
                }
                Ok(())
            }
            Slot::Closed => Err("mailbox closed"),
            _ => Err("mailbox busy"),
        }
    }

    /// Await the next request. Resolves `None` once the mailbox closes.
    pub fn recv_request(&self) -> RecvRequest<Req, Resp> {
        RecvRequest {
            inner: self.inner.clone(),
        }
    }

    /// Non-blocking request check; resets the slot to Idle on a hit.
    pub fn try_take_request(&self) -> Option<Req> {
        let mut inner = self.inner.borrow_mut();
        match std::mem::replace(&mut inner.slot, Slot::Idle) {
            Slot::Request(req) => Some(req),
            other => {
                inner.slot = other;
                None
            }
        }
    }

    /// Publish the response for the request taken last.
    pub fn post_response(&self, resp: Resp) {
        let mut inner = self.inner.borrow_mut();
        if matches!(inner.slot, Slot::Closed) {
            return;
        }
        inner.slot = Slot::Response(resp);
        if let Some(waker) = inner.response_waker.take() {
            waker.wake();
        }
    }

    /// Publish an error instead of a response.
    pub fn post_error(&self, message: impl Into<String>) {
        let mut inner = self.inner.borrow_mut();
        if matches!(inner.slot, Slot::Closed) {
            return;
        }
        inner.slot = Slot::Error(message.into());
        if let Some(waker) = inner.response_waker.take() {
            waker.wake();
        }
    }

    /// Non-blocking response check; resets the slot to Idle on a hit.
    pub fn take_response(&self) -> Option<Result<Resp, String>> {
        let mut inner = self.inner.borrow_mut();
        match std::mem::replace(&mut inner.slot, Slot::Idle) {
            Slot::Response(resp) => Some(Ok(resp)),
            Slot::Error(message) => Some(Err(message)),
            other => {
                inner.slot = other;
                None
            }
        }
    }

    /// Await the response for a posted request.
    pub fn await_response(&self) -> AwaitResponse<Req, Resp> {
        AwaitResponse {
            inner: self.inner.clone(),
        }
    }

    /// Close the mailbox; a parked consumer resolves with `None`.
    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.slot = Slot::Closed;
        if let Some(waker) = inner.request_waker.take() {
            waker.wake();
        }
        if let Some(waker) = inner.response_waker.take() {
            waker.wake();
        }
    }
}

impl<Req, Resp> Default for Mailbox<Req, Resp> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RecvRequest<Req, Resp> {
    inner: Rc<RefCell<Inner<Req, Resp>>>,
}

impl<Req, Resp> Future for RecvRequest<Req, Resp> {
    type Output = Option<Req>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.borrow_mut();
        match std::mem::replace(&mut inner.slot, Slot::Idle) {
            Slot::Request(req) => Poll::Ready(Some(req)),
            Slot::Closed => {
                inner.slot = Slot::Closed;
                Poll::Ready(None)
            }
            other => {
                inner.slot = other;
                inner.request_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

pub struct AwaitResponse<Req, Resp> {
    inner: Rc<RefCell<Inner<Req, Resp>>>,
}

impl<Req, Resp> Future for AwaitResponse<Req, Resp> {
    type Output = Result<Resp, String>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.borrow_mut();
        match std::mem::replace(&mut inner.slot, Slot::Idle) {
            Slot::Response(resp) => Poll::Ready(Ok(resp)),
            Slot::Error(message) => Poll::Ready(Err(message)),
            Slot::Closed => {
                inner.slot = Slot::Closed;
                Poll::Ready(Err("mailbox closed".to_string()))
            }
            other => {
                inner.slot = other;
                inner.response_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::executor::Executor;
    use std::cell::Cell;

    #[test]
    fn test_request_response_round_trip() {
        let exec = Executor::new();
        let mailbox: Mailbox<String, String> = Mailbox::new();

        let consumer = mailbox.clone();
        exec.spawn(async move {
            while let Some(req) = consumer.recv_request().await {
                consumer.post_response(format!("echo: {}", req));
            }
        });

        exec.run_until_stalled();
        mailbox.post_request("hello".to_string()).unwrap();
        exec.run_until_stalled();

        assert_eq!(
            mailbox.take_response(),
            Some(Ok("echo: hello".to_string()))
        );
    }

    #[test]
    fn test_busy_mailbox_rejects_second_request() {
        let mailbox: Mailbox<u32, u32> = Mailbox::new();
        mailbox.post_request(1).unwrap();
        assert!(mailbox.post_request(2).is_err());
    }

    #[test]
    fn test_error_path() {
        let exec = Executor::new();
        let mailbox: Mailbox<u32, u32> = Mailbox::new();

        let consumer = mailbox.clone();
        exec.spawn(async move {
            let _ = consumer.recv_request().await;
            consumer.post_error("denied");
        });

        mailbox.post_request(7).unwrap();
        exec.run_until_stalled();
        assert_eq!(mailbox.take_response(), Some(Err("denied".to_string())));
    }

    #[test]
    fn test_close_wakes_consumer_with_none() {
        let exec = Executor::new();
        let mailbox: Mailbox<u32, u32> = Mailbox::new();
        let finished = Rc::new(Cell::new(false));

        let consumer = mailbox.clone();
        let flag = finished.clone();
        exec.spawn(async move {
            assert!(consumer.recv_request().await.is_none());
            flag.set(true);
        });

        exec.run_until_stalled();
        assert!(!finished.get());
        mailbox.close();
        exec.run_until_stalled();
        assert!(finished.get());
    }

    #[test]
    fn test_await_response() {
        let exec = Executor::new();
        let mailbox: Mailbox<u32, u32> = Mailbox::new();
        let got = Rc::new(Cell::new(0u32));

        let waiter = mailbox.clone();
        let got_clone = got.clone();
        exec.spawn(async move {
            waiter.post_request(21).unwrap();
            let resp = waiter.await_response().await.unwrap();
            got_clone.set(resp);
        });

        exec.run_until_stalled();
        // Some other task services the request.
        let req = {
            let consumer = mailbox.clone();
            let exec2 = &exec;
            let req = Rc::new(Cell::new(0u32));
            let req_clone = req.clone();
            exec2.spawn(async move {
                if let Some(r) = consumer.recv_request().await {
                    req_clone.set(r);
                    consumer.post_response(r * 2);
                }
            });
            exec.run_until_stalled();
            req.get()
        };
        assert_eq!(req, 21);
        assert_eq!(got.get(), 42);
    }
}
