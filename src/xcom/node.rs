// Copyright 2021 The xcom Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::mpsc::{channel, Receiver, Sender};

use log::{debug, info, warn};

use crate::cache::InstanceCache;
use crate::error::Error;
use crate::site_def::SiteDef;
use crate::synode::Synode;
use crate::types::*;
use crate::xcom::{TerminateReason, Xcom, XcomOption, XcomState};

/// The network below a node.
pub trait Transport {
    fn send(&mut self, to: &NodeAddress, bytes: Vec<u8>) -> Result<(), Error>;

    /// Polls a received message, transports which push into
    /// `XcomNode::inbox` leave it alone.
    fn receive(&mut self) -> Option<Vec<u8>> {
        None
    }

    fn is_node_reachable(&self, node: &NodeAddress) -> bool;
}

/// The state machine above a node.
pub trait Application {
    /// Called once per decided value in synode order, and once per local
    /// request which failed.
    fn deliver(&mut self, synode: Synode, payload: &[u8], outcome: Outcome);

    fn on_config(&mut self, _site: &SiteDef) {}
}

/// Events fed by network threads.
#[derive(Debug)]
pub enum Inbound {
    Message(Vec<u8>),
    ConnectionLost(NodeAddress),
}

pub struct XcomNode<C, T, A>
where
    C: InstanceCache,
    T: Transport,
    A: Application,
{
    xcom: Xcom<C>,
    transport: T,
    app: A,

    sender: Sender<Inbound>,
    receiver: Receiver<Inbound>,
}

impl<C, T, A> XcomNode<C, T, A>
where
    C: InstanceCache,
    T: Transport,
    A: Application,
{
    pub fn new(option: XcomOption, me: NodeAddress, cache: C, transport: T, app: A) -> XcomNode<C, T, A> {
        info!("build node {} with options: {:?}", me, option);
        let (tx, rx) = channel();
        XcomNode {
            xcom: Xcom::new(option, me, cache),
            transport,
            app,
            sender: tx,
            receiver: rx,
        }
    }

    pub fn boot(&mut self, site: SiteDef) -> Result<(), Error> {
        self.xcom.boot(site)?;
        self.poll()
    }

    pub fn import_state(&mut self, snapshot: Snapshot) -> Result<(), Error> {
        self.xcom.import_state(snapshot)?;
        self.poll()
    }

    pub fn export_state(&self) -> Snapshot {
        self.xcom.export_state()
    }

    /// Network threads push received messages here.
    pub fn inbox(&self) -> Sender<Inbound> {
        self.sender.clone()
    }

    pub fn tick(&mut self) -> Result<(), Error> {
        self.xcom.tick();
        self.poll()
    }

    pub fn propose(&mut self, payload: Vec<u8>, expiry: Tick) -> Result<u64, Error> {
        let lsn = self.xcom.propose(Cargo::App(payload), expiry)?;
        self.poll()?;
        Ok(lsn)
    }

    pub fn reconfigure(&mut self, cargo: Cargo) -> Result<u64, Error> {
        let lsn = self.xcom.propose(cargo, 0)?;
        self.poll()?;
        Ok(lsn)
    }

    pub fn xcom(&self) -> &Xcom<C> {
        &self.xcom
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    /// Feeds everything received so far into the runtime and hands out
    /// its output. Returns `Exited` once the runtime terminated, or `Fatal` if
    /// it gave up on its own state.
    pub fn poll(&mut self) -> Result<(), Error> {
        while let Ok(inbound) = self.receiver.try_recv() {
            match inbound {
                Inbound::Message(bytes) => self.on_message(&bytes),
                Inbound::ConnectionLost(node) => self.xcom.notify_connection_lost(&node),
            }
        }
        while let Some(bytes) = self.transport.receive() {
            self.on_message(&bytes);
        }

        let ready = self.xcom.advance();
        for site in &ready.installed {
            self.app.on_config(site);
        }
        for delivery in ready.deliveries {
            self.app
                .deliver(delivery.synode, &delivery.payload, delivery.outcome);
        }
        for failed in ready.failures {
            let delivery = Delivery::from(failed);
            self.app
                .deliver(delivery.synode, &delivery.payload, delivery.outcome);
        }
        for envelope in ready.msgs {
            self.send(envelope)?;
        }

        match self.xcom.state() {
            XcomState::Terminated(TerminateReason::Fatal(msg)) => {
                warn!("node {} is terminated: {}", self.xcom.address(), msg);
                Err(Error::Fatal(msg.clone()))
            }
            XcomState::Terminated(reason) => {
                debug!("node {} is terminated: {:?}", self.xcom.address(), reason);
                Err(Error::Exited)
            }
            _ => Ok(()),
        }
    }

    fn on_message(&mut self, bytes: &[u8]) {
        match serde_json::from_slice::<PaxMsg>(bytes) {
            Ok(msg) => self.xcom.step(msg),
            Err(err) => warn!(
                "node {} drop a message of {} bytes: {}",
                self.xcom.address(),
                bytes.len(),
                err
            ),
        }
    }

    fn send(&mut self, envelope: Envelope) -> Result<(), Error> {
        if !self.transport.is_node_reachable(&envelope.to) {
            self.xcom.notify_connection_lost(&envelope.to);
            return Ok(());
        }
        let bytes = serde_json::to_vec(&envelope.msg)?;
        if let Err(err) = self.transport.send(&envelope.to, bytes) {
            debug!(
                "node {} send {} to {}: {}",
                self.xcom.address(),
                envelope.msg.op,
                envelope.to,
                err
            );
            self.xcom.notify_connection_lost(&envelope.to);
        }
        Ok(())
    }
}
