use std::sync::Arc;

use umbra_common::crypto::{Ed25519KeyPair, Ed25519Signature, PublicKey};

// Snapshot of an acquired pool wallet held by a route
//
// The pool record stays authoritative; the route only keeps the fields
// it needs to sign hops, captured at acquire time.
pub struct RouteHop {
    pub public_key: PublicKey,
    pub keypair: Ed25519KeyPair,
}

// Per route state machine, advanced by the executor driver loop
//
// fund_head -> hop(0) -> ... -> hop(H-1) -> delivered -> complete
// with recovery(i) on stuck hops and failed as the other terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    FundHead,
    Hop(usize),
    Delivered,
    Recovery(usize),
    Complete,
    Failed,
}

impl RouteState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    // Hop index a wind-down has to recover from
    pub fn current_hop(&self) -> usize {
        match self {
            Self::Hop(i) | Self::Recovery(i) => *i,
            _ => 0,
        }
    }
}

// One destination's path through the intermediaries
pub struct Route {
    pub id: usize,
    // opaque id tying pool allocations to this mix request
    pub request_id: String,
    pub source: Arc<Ed25519KeyPair>,
    pub fee_source: Option<Arc<Ed25519KeyPair>>,
    pub intermediates: Vec<RouteHop>,
    pub destination: PublicKey,
    // value to deliver to the destination
    pub amount: u64,
    // conservative per hop fee allowance
    pub fee_buffer: u64,
    // extra funding absorbing priority fee bumps during retries
    pub safety_margin: u64,
    pub state: RouteState,
    // every signature submitted on behalf of this route
    pub signatures: Vec<Ed25519Signature>,
    pub error: Option<String>,
    // destination balance observed before funding, used by the
    // delivery post-check
    pub destination_balance_before: Option<u64>,
    // set when recovery may re-submit the pending hop transfer, unset
    // when only the salvage sweep is allowed
    pub resubmit_pending: bool,
}

impl Route {
    pub fn hop_count(&self) -> usize {
        self.intermediates.len()
    }

    // Value injected at hop 0: the delivered amount plus the full fee
    // budget of the route
    pub fn head_funding(&self) -> u64 {
        self.amount + self.hop_count() as u64 * self.fee_buffer + self.safety_margin
    }

    // Balance expected on intermediate i before it forwards
    pub fn expected_at(&self, hop: usize) -> u64 {
        self.amount + (self.hop_count() - hop) as u64 * self.fee_buffer + self.safety_margin
    }

    // Target and amount of the transfer leaving intermediate `hop`
    pub fn transfer_from(&self, hop: usize) -> (PublicKey, u64) {
        if hop + 1 == self.hop_count() {
            // final transfer delivers the exact amount, the residual
            // stays behind and is swept during release
            (self.destination, self.amount)
        } else {
            (
                self.intermediates[hop + 1].public_key,
                self.expected_at(hop + 1),
            )
        }
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("amount", &self.amount)
            .field("hops", &self.hop_count())
            .field("state", &self.state)
            .finish()
    }
}
