//! Fault injection.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Probabilities of injected faults, given to a process at spawn time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FaultProps {
    /// Probability that a send is dropped.
    pub send: f64,
    /// Probability that a received message is dropped.
    pub receive: f64,
    /// Probability that the process hangs at a label.
    pub hang: f64,
    /// Probability that the process crashes at a label.
    pub crash: f64,
}

impl FaultProps {
    /// Set send loss probability.
    pub fn send_loss(mut self, probability: f64) -> Self {
        self.send = probability;
        self
    }

    /// Set receive loss probability.
    pub fn receive_loss(mut self, probability: f64) -> Self {
        self.receive = probability;
        self
    }

    /// Set hang probability.
    pub fn hang(mut self, probability: f64) -> Self {
        self.hang = probability;
        self
    }

    /// Set crash probability.
    pub fn crash(mut self, probability: f64) -> Self {
        self.crash = probability;
        self
    }
}

/// Kind of injected fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// Drop outgoing message.
    Send,
    /// Drop incoming message.
    Receive,
    /// Hang at label.
    Hang,
    /// Crash at label.
    Crash,
}

/// Per-process fault probabilities with their random source.
pub(crate) struct FaultInjector {
    props: FaultProps,
    rng: StdRng,
}

impl FaultInjector {
    pub fn new(props: FaultProps, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { props, rng }
    }

    /// Draws whether the fault happens now.
    pub fn fails(&mut self, kind: FaultKind) -> bool {
        let probability = match kind {
            FaultKind::Send => self.props.send,
            FaultKind::Receive => self.props.receive,
            FaultKind::Hang => self.props.hang,
            FaultKind::Crash => self.props.crash,
        };
        self.chance(probability)
    }

    /// Draws event of the given probability.
    pub fn chance(&mut self, probability: f64) -> bool {
        probability > 0.0 && self.rng.gen::<f64>() < probability
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}
