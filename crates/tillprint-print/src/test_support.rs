// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Shared fixtures for unit tests: a sample receipt and a scripted printer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use tillprint_core::error::{Result, TillprintError};
use tillprint_core::types::{
    LineItem, Merchant, PrintJob, PrinterProtocol, PrinterTarget, ReceiptPayload,
};

use crate::transport::{PrinterConnection, Transport};

pub(crate) fn sample_payload() -> ReceiptPayload {
    ReceiptPayload {
        merchant: Merchant {
            name: "Corner Cafe".into(),
            address: vec!["12 High Street".into()],
            phone: None,
            tax_id: None,
        },
        order_reference: "ORD-1001".into(),
        items: vec![
            LineItem {
                name: "Flat white".into(),
                quantity: 1,
                unit_price: 999,
            },
            LineItem {
                name: "Croissant".into(),
                quantity: 1,
                unit_price: 999,
            },
        ],
        subtotal: 1998,
        taxes: vec![],
        total: 1998,
        currency: "USD".into(),
        payment_method: None,
        footer: None,
        issued_at: None,
    }
}

pub(crate) fn sample_target() -> PrinterTarget {
    PrinterTarget::new("10.0.0.5", 9100, PrinterProtocol::EscPos)
}

pub(crate) fn sample_job() -> PrintJob {
    PrintJob::new(sample_payload(), sample_target())
}

/// What the scripted printer does with the next `send`.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Accept,
    Fail(&'static str),
    /// Never completes; the caller's timeout has to fire.
    Stall,
    /// A slow printer: accepts after the delay.
    Delay(Duration),
}

#[derive(Debug, Default)]
struct Script {
    steps: VecDeque<Step>,
    connects: usize,
    refuse: usize,
    sent: Vec<Vec<u8>>,
    alive: Vec<Arc<AtomicBool>>,
}

/// In-memory printer. Sends follow the script, then accept everything.
#[derive(Clone, Default)]
pub(crate) struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    pub(crate) fn new(steps: Vec<Step>) -> Self {
        let transport = Self::default();
        transport.lock().steps = steps.into();
        transport
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().expect("script lock")
    }

    pub(crate) fn connects(&self) -> usize {
        self.lock().connects
    }

    /// Payloads accepted so far.
    pub(crate) fn sent(&self) -> Vec<Vec<u8>> {
        self.lock().sent.clone()
    }

    /// Simulate the printer closing every open socket.
    pub(crate) fn hang_up_all(&self) {
        for flag in &self.lock().alive {
            flag.store(false, Ordering::SeqCst);
        }
    }

    /// Refuse the next `n` connection attempts.
    pub(crate) fn refuse_connects(&self, n: usize) {
        self.lock().refuse = n;
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, target: &PrinterTarget) -> Result<Box<dyn PrinterConnection>> {
        let mut script = self.lock();
        if script.refuse > 0 {
            script.refuse -= 1;
            return Err(TillprintError::TransientDispatch(format!(
                "connect to {}: connection refused",
                target.key()
            )));
        }
        script.connects += 1;
        let alive = Arc::new(AtomicBool::new(true));
        script.alive.push(Arc::clone(&alive));
        Ok(Box::new(ScriptedConnection {
            script: Arc::clone(&self.script),
            alive,
        }))
    }
}

#[derive(Debug)]
struct ScriptedConnection {
    script: Arc<Mutex<Script>>,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl PrinterConnection for ScriptedConnection {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let step = self
            .script
            .lock()
            .expect("script lock")
            .steps
            .pop_front()
            .unwrap_or(Step::Accept);

        match step {
            Step::Accept => {
                self.script.lock().expect("script lock").sent.push(bytes.to_vec());
                Ok(())
            }
            Step::Fail(reason) => {
                self.alive.store(false, Ordering::SeqCst);
                Err(TillprintError::TransientDispatch(reason.to_string()))
            }
            Step::Stall => {
                std::future::pending::<()>().await;
                Ok(())
            }
            Step::Delay(delay) => {
                tokio::time::sleep(delay).await;
                self.script.lock().expect("script lock").sent.push(bytes.to_vec());
                Ok(())
            }
        }
    }

    fn is_alive(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}
