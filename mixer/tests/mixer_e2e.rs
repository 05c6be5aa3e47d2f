// End to end scenarios for the mixer core, driven entirely through a
// scriptable stub ledger. Time is paused so polling cadences and
// confirmation timeouts resolve instantly.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use umbra_common::{
    config::{COIN_VALUE, DUST_THRESHOLD},
    crypto::{Ed25519KeyPair, Ed25519Signature, PublicKey},
    rpc::JsonRpcError,
};
use umbra_mixer::{
    cipher::Cipher,
    config::MixConfig,
    gateway::{Commitment, Ledger, RpcGateway, SendOptions, SignatureStatus},
    mixer::{MixRequest, Mixer, RouteStatus},
    pool::WalletPool,
    transaction::{decode_transfer, TransferPayload},
    MixerError,
};

// Flat fee charged by the stub chain per confirmed transfer
const STUB_FEE: u64 = 5_000;

#[derive(Clone)]
struct SentTransfer {
    payload: TransferPayload,
    signature: Ed25519Signature,
    // ordinal of the send_transaction call that produced it
    ordinal: usize,
    confirmed: bool,
}

#[derive(Default)]
struct StubState {
    balances: HashMap<PublicKey, u64>,
    sent: Vec<SentTransfer>,
    // every send_transaction call, including rejected ones
    send_attempts: usize,
    // sends rejected with "tx failed" before any succeeds
    fail_sends: usize,
    // only the first N sends ever confirm; the rest stay pending
    confirm_limit: Option<usize>,
}

// A scriptable in-memory chain implementing the ledger surface
struct StubLedger {
    state: Mutex<StubState>,
    blockhash_counter: AtomicUsize,
}

impl StubLedger {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(StubState::default()),
            blockhash_counter: AtomicUsize::new(0),
        })
    }

    fn set_balance(&self, address: PublicKey, amount: u64) {
        self.state.lock().unwrap().balances.insert(address, amount);
    }

    fn balance_of(&self, address: &PublicKey) -> u64 {
        *self
            .state
            .lock()
            .unwrap()
            .balances
            .get(address)
            .unwrap_or(&0)
    }

    fn fail_next_sends(&self, count: usize) {
        self.state.lock().unwrap().fail_sends = count;
    }

    fn confirm_only_first(&self, count: usize) {
        self.state.lock().unwrap().confirm_limit = Some(count);
    }

    fn send_count(&self) -> usize {
        self.state.lock().unwrap().sent.len()
    }

    fn send_attempts(&self) -> usize {
        self.state.lock().unwrap().send_attempts
    }

    fn confirmed_transfers(&self) -> Vec<TransferPayload> {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|t| t.confirmed)
            .map(|t| t.payload.clone())
            .collect()
    }
}

#[async_trait]
impl Ledger for StubLedger {
    async fn latest_blockhash(&self, _: Commitment) -> Result<String, JsonRpcError> {
        let counter = self.blockhash_counter.fetch_add(1, Ordering::SeqCst);
        Ok(format!("BLOCKHASH{}", counter))
    }

    async fn balance(&self, address: &PublicKey, _: Commitment) -> Result<u64, JsonRpcError> {
        Ok(self.balance_of(address))
    }

    async fn send_transaction(
        &self,
        transaction: &str,
        _: &SendOptions,
    ) -> Result<Ed25519Signature, JsonRpcError> {
        let (payload, signature) = decode_transfer(transaction).ok_or_else(|| {
            JsonRpcError::InvalidValue("transaction does not decode".to_owned())
        })?;

        let mut state = self.state.lock().unwrap();
        state.send_attempts += 1;
        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            return Err(JsonRpcError::Server {
                code: -32002,
                message: "tx failed".to_owned(),
            });
        }

        let sender_balance = *state.balances.get(&payload.from).unwrap_or(&0);
        if sender_balance < payload.amount + STUB_FEE {
            return Err(JsonRpcError::Server {
                code: -32003,
                message: "insufficient funds for transfer".to_owned(),
            });
        }

        let ordinal = state.sent.len();
        state.sent.push(SentTransfer {
            payload,
            signature,
            ordinal,
            confirmed: false,
        });
        Ok(signature)
    }

    async fn signature_statuses(
        &self,
        signatures: &[Ed25519Signature],
    ) -> Result<Vec<Option<SignatureStatus>>, JsonRpcError> {
        let mut state = self.state.lock().unwrap();
        let confirm_limit = state.confirm_limit;

        let mut statuses = Vec::with_capacity(signatures.len());
        for signature in signatures {
            let Some(index) = state.sent.iter().position(|t| t.signature == *signature) else {
                statuses.push(None);
                continue;
            };

            let allowed = confirm_limit.map_or(true, |limit| state.sent[index].ordinal < limit);
            if !allowed {
                // submitted but the chain never moves it forward
                statuses.push(Some(SignatureStatus {
                    confirmation: None,
                    error: None,
                }));
                continue;
            }

            if !state.sent[index].confirmed {
                // settle the transfer on first observation
                let payload = state.sent[index].payload.clone();
                let fee_account = payload.fee_payer.unwrap_or(payload.from);
                let sender = state.balances.entry(payload.from).or_insert(0);
                *sender = sender.saturating_sub(payload.amount);
                let payer = state.balances.entry(fee_account).or_insert(0);
                *payer = payer.saturating_sub(STUB_FEE);
                *state.balances.entry(payload.to).or_insert(0) += payload.amount;
                state.sent[index].confirmed = true;
            }

            statuses.push(Some(SignatureStatus {
                confirmation: Some(Commitment::Finalized),
                error: None,
            }));
        }

        Ok(statuses)
    }

    async fn account_data(
        &self,
        _: &PublicKey,
        _: Commitment,
    ) -> Result<Option<Vec<u8>>, JsonRpcError> {
        Ok(None)
    }
}

struct Harness {
    ledger: Arc<StubLedger>,
    pool: Arc<WalletPool>,
    mixer: Mixer,
    source: Ed25519KeyPair,
    salvage: PublicKey,
    _dir: tempfile::TempDir,
}

fn base58_secret(keypair: &Ed25519KeyPair) -> String {
    let mut full = [0u8; 64];
    full[..32].copy_from_slice(keypair.secret_key().as_bytes());
    full[32..].copy_from_slice(keypair.public_key().as_bytes());
    bs58::encode(full).into_string()
}

// Spin up a funded stub chain and a seeded pool
fn harness(pool_size: usize, growth_step: usize) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let cipher = Arc::new(Cipher::new(b"e2e encryption secret").unwrap());
    let pool = Arc::new(
        WalletPool::open(dir.path().to_str().unwrap(), cipher, growth_step.max(1)).unwrap(),
    );
    while pool_size > 0 && pool.stats().unwrap().available < pool_size {
        let generated = pool.ensure_health(pool_size).unwrap();
        assert!(generated > 0, "pool seeding stalled");
    }

    let ledger = StubLedger::new();
    let gateway = Arc::new(RpcGateway::new(
        Arc::<StubLedger>::clone(&ledger),
        &MixConfig::default().rpc_limits,
    ));

    let source = Ed25519KeyPair::generate();
    ledger.set_balance(source.public_key(), 100 * COIN_VALUE);

    let salvage = Ed25519KeyPair::generate().public_key();
    let mixer = Mixer::new(Arc::clone(&pool), gateway, Some(salvage));

    Harness {
        ledger,
        pool,
        mixer,
        source,
        salvage,
        _dir: dir,
    }
}

fn mix_request(harness: &Harness, total: u64, destinations: &[PublicKey]) -> MixRequest {
    MixRequest {
        source_secret: base58_secret(&harness.source),
        fee_source_secret: None,
        total_amount: total,
        destinations: destinations.iter().map(|d| d.to_base58()).collect(),
        custom_amounts: None,
    }
}

fn config(hop_count: usize) -> MixConfig {
    MixConfig {
        hop_count,
        ..MixConfig::default()
    }
}

// S1: two routes through a healthy pool and chain
#[tokio::test(start_paused = true)]
async fn test_two_routes_complete_and_preserve_total() {
    let harness = harness(16, 16);
    let dest1 = Ed25519KeyPair::generate().public_key();
    let dest2 = Ed25519KeyPair::generate().public_key();

    let request = mix_request(&harness, COIN_VALUE, &[dest1, dest2]);
    let result = harness.mixer.run_mix(request, config(8)).await.unwrap();

    assert!(result.aggregate_ok);
    assert_eq!(result.routes.len(), 2);
    for route in &result.routes {
        assert_eq!(route.status, RouteStatus::Complete);
        // funding + 8 hops
        assert_eq!(route.signatures.len(), 9);
    }

    // delivered values sum exactly to the input, each near an even
    // split (5% jitter)
    let delivered1 = harness.ledger.balance_of(&dest1);
    let delivered2 = harness.ledger.balance_of(&dest2);
    assert_eq!(delivered1 + delivered2, COIN_VALUE);
    for delivered in [delivered1, delivered2] {
        assert!(delivered >= COIN_VALUE / 2 - COIN_VALUE / 18);
        assert!(delivered <= COIN_VALUE / 2 + COIN_VALUE / 18);
    }

    // every wallet ended cooling then available, with a drained
    // on-chain balance
    let transfers = harness.ledger.confirmed_transfers();
    let stats = harness.pool.stats().unwrap();
    assert_eq!(stats.total, 16);
    assert_eq!(stats.available, 16);
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.error, 0);
    for transfer in &transfers {
        if transfer.to != dest1 && transfer.to != dest2 {
            assert!(harness.ledger.balance_of(&transfer.to) <= DUST_THRESHOLD);
        }
    }
}

// T2: intermediaries are never shared between concurrent routes
#[tokio::test(start_paused = true)]
async fn test_intermediary_sets_disjoint() {
    let harness = harness(16, 16);
    let dest1 = Ed25519KeyPair::generate().public_key();
    let dest2 = Ed25519KeyPair::generate().public_key();

    let request = mix_request(&harness, COIN_VALUE, &[dest1, dest2]);
    let result = harness.mixer.run_mix(request, config(8)).await.unwrap();
    assert!(result.aggregate_ok);

    // walk each route backwards from its destination
    let transfers = harness.ledger.confirmed_transfers();
    let intermediaries_of = |dest: PublicKey| -> Vec<PublicKey> {
        let mut hops = Vec::new();
        let mut cursor = dest;
        while let Some(transfer) = transfers.iter().find(|t| t.to == cursor) {
            if transfer.from == harness.source.public_key() {
                break;
            }
            hops.push(transfer.from);
            cursor = transfer.from;
        }
        hops
    };

    let hops1 = intermediaries_of(dest1);
    let hops2 = intermediaries_of(dest2);
    assert_eq!(hops1.len(), 8);
    assert_eq!(hops2.len(), 8);
    for hop in &hops1 {
        assert!(!hops2.contains(hop));
    }
}

// S2: the pool cannot cover two routes even after one grow
#[tokio::test(start_paused = true)]
async fn test_insufficient_pool_after_one_grow() {
    let harness = harness(8, 4);
    let dest1 = Ed25519KeyPair::generate().public_key();
    let dest2 = Ed25519KeyPair::generate().public_key();

    let request = mix_request(&harness, COIN_VALUE, &[dest1, dest2]);
    let result = harness.mixer.run_mix(request, config(8)).await;
    assert!(matches!(result, Err(MixerError::InsufficientPool { .. })));

    // the first route's wallets were handed back
    let stats = harness.pool.stats().unwrap();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.available, stats.total);
    // exactly one grow happened
    assert_eq!(stats.total, 12);
    // nothing reached the chain
    assert_eq!(harness.ledger.send_count(), 0);
}

// S3: one submission-level failure is retried and the route completes
#[tokio::test(start_paused = true)]
async fn test_transient_send_failure_retried() {
    let harness = harness(4, 4);
    let dest = Ed25519KeyPair::generate().public_key();
    harness.ledger.fail_next_sends(1);

    let total = 3 * COIN_VALUE / 10;
    let request = mix_request(&harness, total, &[dest]);
    let result = harness.mixer.run_mix(request, config(4)).await.unwrap();

    assert!(result.aggregate_ok);
    assert_eq!(result.routes.len(), 1);
    // 1 funding + 4 hops confirmed
    assert_eq!(result.routes[0].signatures.len(), 5);
    assert_eq!(harness.ledger.send_count(), 5);
    // plus the one rejected submission
    assert_eq!(harness.ledger.send_attempts(), 6);
    assert_eq!(harness.ledger.confirmed_transfers().len(), 5);
    assert_eq!(harness.ledger.balance_of(&dest), total);
}

// S4: a hop that never confirms fails the route through recovery
#[tokio::test(start_paused = true)]
async fn test_unconfirmed_hop_fails_with_recovery_sweep() {
    let harness = harness(4, 4);
    let dest = Ed25519KeyPair::generate().public_key();
    // funding + hops 0..2 confirm, the final hop never does
    harness.ledger.confirm_only_first(4);

    let total = COIN_VALUE / 5;
    let request = mix_request(&harness, total, &[dest]);
    let mut config = config(4);
    config.balance_check_timeout = 5_000;
    let result = harness.mixer.run_mix(request, config).await.unwrap();

    assert!(!result.aggregate_ok);
    assert_eq!(result.routes[0].status, RouteStatus::Failed);
    assert!(result.routes[0].error.is_some());

    // nothing was delivered
    assert_eq!(harness.ledger.balance_of(&dest), 0);

    // recovery attempted a sweep: sends beyond the straight-line five
    assert!(harness.ledger.send_count() > 5);

    // the stuck intermediary is parked as error, the drained ones are
    // available again
    let stats = harness.pool.stats().unwrap();
    assert_eq!(stats.error, 1);
    assert_eq!(stats.available, 3);
    assert_eq!(stats.in_use, 0);
}

// S5: two concurrent requests racing for one pool allocation
#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_one_wins() {
    let harness = harness(8, 2);
    let harness = Arc::new(harness);
    let dest1 = Ed25519KeyPair::generate().public_key();
    let dest2 = Ed25519KeyPair::generate().public_key();

    let run = |dest: PublicKey| {
        let harness = Arc::clone(&harness);
        async move {
            let request = mix_request(&harness, COIN_VALUE / 2, &[dest]);
            harness.mixer.run_mix(request, config(8)).await
        }
    };

    let (first, second) = tokio::join!(run(dest1), run(dest2));

    let outcomes = [first, second];
    let completed = outcomes
        .iter()
        .filter(|r| r.as_ref().is_ok_and(|r| r.aggregate_ok))
        .count();
    let exhausted = outcomes
        .iter()
        .filter(|r| matches!(r, Err(MixerError::InsufficientPool { .. })))
        .count();
    assert_eq!(completed, 1, "exactly one request may win the pool");
    assert_eq!(exhausted, 1);

    // the winner's wallets went through cooling back to available
    let stats = harness.pool.stats().unwrap();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.error, 0);
}

// S6: a wallet encrypted under a rotated secret fails only its route
#[tokio::test(start_paused = true)]
async fn test_rotated_secret_fails_single_route() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_str().unwrap().to_owned();

    // one wallet sealed with the old secret
    {
        let old_cipher = Arc::new(Cipher::new(b"old rotation secret").unwrap());
        let pool = WalletPool::open(&path, old_cipher, 1).unwrap();
        pool.ensure_health(1).unwrap();
    }

    let cipher = Arc::new(Cipher::new(b"e2e encryption secret").unwrap());
    let pool = Arc::new(WalletPool::open(&path, cipher, 16).unwrap());
    while pool.stats().unwrap().available < 16 {
        pool.ensure_health(16).unwrap();
    }

    let ledger = StubLedger::new();
    let gateway = Arc::new(RpcGateway::new(
        Arc::<StubLedger>::clone(&ledger),
        &MixConfig::default().rpc_limits,
    ));
    let source = Ed25519KeyPair::generate();
    ledger.set_balance(source.public_key(), 100 * COIN_VALUE);
    let mixer = Mixer::new(Arc::clone(&pool), gateway, None);

    let dest1 = Ed25519KeyPair::generate().public_key();
    let dest2 = Ed25519KeyPair::generate().public_key();
    let request = MixRequest {
        source_secret: base58_secret(&source),
        fee_source_secret: None,
        total_amount: COIN_VALUE,
        destinations: vec![dest1.to_base58(), dest2.to_base58()],
        custom_amounts: None,
    };

    let result = mixer.run_mix(request, config(8)).await.unwrap();

    assert!(!result.aggregate_ok);
    let completed: Vec<_> = result
        .routes
        .iter()
        .filter(|r| r.status == RouteStatus::Complete)
        .collect();
    let failed: Vec<_> = result
        .routes
        .iter()
        .filter(|r| r.status == RouteStatus::Failed)
        .collect();
    assert_eq!(completed.len(), 1);
    assert_eq!(failed.len(), 1);
    assert!(failed[0]
        .error
        .as_deref()
        .unwrap()
        .contains("cannot be decrypted"));

    // the poisoned wallet is parked, everything else recovered
    let stats = pool.stats().unwrap();
    assert_eq!(stats.error, 1);
    assert_eq!(stats.in_use, 0);

    // the surviving route delivered its share
    let delivered = ledger.balance_of(&dest1) + ledger.balance_of(&dest2);
    assert!(delivered > 0);
}

// A cancelled request winds down through the salvage sweep and never
// reports complete
#[tokio::test(start_paused = true)]
async fn test_cancellation_sweeps_to_salvage() {
    let harness = Arc::new(harness(4, 4));
    let dest = Ed25519KeyPair::generate().public_key();

    let request = mix_request(&harness, COIN_VALUE / 2, &[dest]);
    let mut config = config(4);
    // slow the route down so the cancellation lands mid-flight
    config.min_delay = 1_000;
    config.max_delay = 1_500;

    let (handle, cancelled) = Mixer::cancellation();
    let mix = {
        let harness = Arc::clone(&harness);
        tokio::spawn(async move {
            harness
                .mixer
                .run_mix_cancellable(request, config, cancelled)
                .await
        })
    };

    tokio::time::sleep(std::time::Duration::from_millis(4_000)).await;
    handle.cancel();

    let result = mix.await.unwrap().unwrap();
    assert!(!result.aggregate_ok);
    assert_eq!(result.routes[0].status, RouteStatus::Failed);
    assert!(result.routes[0]
        .error
        .as_deref()
        .unwrap()
        .contains("cancelled"));

    // nothing reached the destination, the stranded value went to the
    // salvage address
    assert_eq!(harness.ledger.balance_of(&dest), 0);
    assert!(harness.ledger.balance_of(&harness.salvage) > 0);

    // no wallet is stranded in_use
    let stats = harness.pool.stats().unwrap();
    assert_eq!(stats.in_use, 0);
}

#[derive(Default)]
struct CaptureLogger {
    lines: Mutex<Vec<String>>,
}

impl log::Log for CaptureLogger {
    fn enabled(&self, _: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        self.lines
            .lock()
            .unwrap()
            .push(format!("{}", record.args()));
    }

    fn flush(&self) {}
}

// T5: no log line ever carries plaintext key material
#[tokio::test(start_paused = true)]
async fn test_no_secret_material_in_logs() {
    let logger: &'static CaptureLogger = Box::leak(Box::new(CaptureLogger::default()));
    log::set_logger(logger).expect("no other logger is installed in this binary");
    log::set_max_level(log::LevelFilter::Trace);

    let harness = harness(4, 4);
    let dest = Ed25519KeyPair::generate().public_key();
    let source_secret = base58_secret(&harness.source);

    let request = mix_request(&harness, COIN_VALUE / 2, &[dest]);
    let result = harness.mixer.run_mix(request, config(4)).await.unwrap();
    assert!(result.aggregate_ok);

    let hex_secret = hex::encode(harness.source.secret_key().as_bytes());
    let lines = logger.lines.lock().unwrap();
    assert!(!lines.is_empty(), "the mix run should log something");
    for line in lines.iter() {
        assert!(!line.contains(&source_secret));
        assert!(!line.contains(&hex_secret));
    }
}

// An unfunded source fails the request before anything is submitted
#[tokio::test(start_paused = true)]
async fn test_unfunded_source_rejected() {
    let harness = harness(4, 4);
    let dest = Ed25519KeyPair::generate().public_key();
    harness.ledger.set_balance(harness.source.public_key(), 1_000);

    let request = mix_request(&harness, COIN_VALUE / 2, &[dest]);
    let result = harness.mixer.run_mix(request, config(4)).await;

    assert!(matches!(
        result,
        Err(MixerError::InsufficientFunds { .. })
    ));
    assert_eq!(harness.ledger.send_count(), 0);
    let stats = harness.pool.stats().unwrap();
    assert_eq!(stats.in_use, 0);
}
