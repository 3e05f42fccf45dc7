// This file is part of VELA.
//
// Copyright (C) 2023 The Vela Project.
//
// VELA is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// VELA is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with VELA. If not, see <https://www.gnu.org/licenses/>.

//! Bounded channels connecting the node services.
//!
//! Two flavors are provided on top of the async-std channel: a plain mpmc
//! channel, and a request/response channel where every request travels with
//! a dedicated response sender so the consumer can answer the exact
//! producer that asked.

use async_std::{
    channel::{self as async_channel, Receiver as AsyncReceiver, Sender as AsyncSender},
    future, task,
};
use std::{fmt::Display, pin::Pin, time::Duration};

/// Upper bound to outstanding channel elements.
const CHANNEL_BOUND: usize = 1024;

/// Errors which can be triggered by a channel.
#[derive(Debug, PartialEq, Eq)]
pub enum ChannelError {
    /// Error during send. Broken channel.
    SendError,
    /// Error during receive. Broken channel.
    RecvError,
    /// Timeout during receive.
    RecvTimeout,
    /// Nothing buffered at poll time.
    Empty,
}

impl std::error::Error for ChannelError {}

impl Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            ChannelError::SendError => "channel send error",
            ChannelError::RecvError => "channel recv error",
            ChannelError::RecvTimeout => "channel recv timeout",
            ChannelError::Empty => "channel empty",
        };
        write!(f, "{}", msg)
    }
}

/// Creates a simple mpmc channel.
pub fn simple_channel<T>() -> (Sender<T>, Receiver<T>) {
    let (sender, receiver) = async_channel::bounded::<T>(CHANNEL_BOUND);
    (Sender(sender), Receiver(receiver))
}

/// Channel sender side.
#[derive(Clone)]
pub struct Sender<T>(AsyncSender<T>);

impl<T> Sender<T> {
    pub async fn send(&self, value: T) -> Result<(), ChannelError> {
        self.0.send(value).await.map_err(|_| ChannelError::SendError)
    }

    /// Send, synchronous wrapper.
    pub fn send_sync(&self, value: T) -> Result<(), ChannelError> {
        task::block_on(self.send(value))
    }

    /// Closes the channel. Outstanding messages can still be received.
    pub fn close(&self) -> bool {
        self.0.close()
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Channel receiver side.
#[derive(Clone)]
pub struct Receiver<T>(AsyncReceiver<T>);

impl<T> Receiver<T> {
    pub async fn recv(&self) -> Result<T, ChannelError> {
        self.0.recv().await.map_err(|_| ChannelError::RecvError)
    }

    /// Receive with an upper wait bound.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<T, ChannelError> {
        match future::timeout(timeout, self.0.recv()).await {
            Ok(res) => res.map_err(|_| ChannelError::RecvError),
            Err(_) => Err(ChannelError::RecvTimeout),
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Result<T, ChannelError> {
        self.0.try_recv().map_err(|err| match err {
            async_channel::TryRecvError::Empty => ChannelError::Empty,
            async_channel::TryRecvError::Closed => ChannelError::RecvError,
        })
    }

    /// Receive, synchronous wrapper.
    pub fn recv_sync(&self) -> Result<T, ChannelError> {
        task::block_on(self.recv())
    }

    /// Receive with timeout, synchronous wrapper.
    pub fn recv_timeout_sync(&self, timeout: Duration) -> Result<T, ChannelError> {
        task::block_on(self.recv_timeout(timeout))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Closes the channel. Outstanding messages can still be received.
    pub fn close(&self) -> bool {
        self.0.close()
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Create a request/response channel pair.
///
/// The `RequestSender` can be cloned so multiple producers can submit
/// requests to the same `RequestReceiver`.
pub fn confirmed_channel<Req, Res>() -> (RequestSender<Req, Res>, RequestReceiver<Req, Res>) {
    let (tx, rx) = async_channel::bounded::<(Req, Sender<Res>)>(CHANNEL_BOUND);
    (RequestSender(tx), RequestReceiver(rx))
}

/// Producer half of the request/response channel.
#[derive(Clone)]
pub struct RequestSender<Req, Res>(AsyncSender<(Req, Sender<Res>)>);

impl<Req, Res> RequestSender<Req, Res> {
    /// Submit a request; the returned receiver yields the response.
    pub async fn send(&self, request: Req) -> Result<Receiver<Res>, ChannelError> {
        let (response_tx, response_rx) = simple_channel();
        self.0
            .send((request, response_tx))
            .await
            .map_err(|_| ChannelError::SendError)
            .map(|_| response_rx)
    }

    /// Submit a request, synchronous wrapper.
    pub fn send_sync(&self, request: Req) -> Result<Receiver<Res>, ChannelError> {
        task::block_on(self.send(request))
    }

    pub fn close(&self) -> bool {
        self.0.close()
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Consumer half of the request/response channel.
#[derive(Clone)]
pub struct RequestReceiver<Req, Res>(AsyncReceiver<(Req, Sender<Res>)>);

impl<Req, Res> RequestReceiver<Req, Res> {
    /// Wait for the next request together with its response sender.
    pub async fn recv(&self) -> Result<(Req, Sender<Res>), ChannelError> {
        self.0.recv().await.map_err(|_| ChannelError::RecvError)
    }

    /// Wait for the next request with an upper bound.
    pub async fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<(Req, Sender<Res>), ChannelError> {
        match future::timeout(timeout, self.0.recv()).await {
            Ok(res) => res.map_err(|_| ChannelError::RecvError),
            Err(_) => Err(ChannelError::RecvTimeout),
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Result<(Req, Sender<Res>), ChannelError> {
        self.0.try_recv().map_err(|err| match err {
            async_channel::TryRecvError::Empty => ChannelError::Empty,
            async_channel::TryRecvError::Closed => ChannelError::RecvError,
        })
    }

    /// Wait for the next request, synchronous wrapper.
    pub fn recv_sync(&self) -> Result<(Req, Sender<Res>), ChannelError> {
        task::block_on(self.recv())
    }

    pub fn close(&self) -> bool {
        self.0.close()
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Type alias for the sender traveling along with each request.
pub type ResponseSender<Res> = Sender<Res>;

/// Type alias for the receiver returned by `RequestSender::send`.
pub type ResponseReceiver<Res> = Receiver<Res>;

/// Stream implementation for [`Receiver`].
impl<T> futures::Stream for Receiver<T> {
    type Item = T;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        Pin::new(&mut self.0).poll_next(cx)
    }
}

/// Stream implementation for [`RequestReceiver`].
impl<Req, Res> futures::Stream for RequestReceiver<Req, Res> {
    type Item = (Req, ResponseSender<Res>);

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        Pin::new(&mut self.0).poll_next(cx)
    }
}
