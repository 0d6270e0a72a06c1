//! Test support utilities shared across unit and integration tests.
//!
//! The doubles here record every call and replay scripted responses so that
//! provisioning and fan-out behaviour can be exercised without a provider or
//! a remote shell. Each double is cheap to clone; clones share state.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::OsString;
use std::future::ready;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};

use crate::clock::{Clock, Interrupted, PauseFuture};
use crate::context::FleetContext;
use crate::gateway::{
    BidDescription, BidRequest, BidState, BidTicket, Datapoint, DiscoveredUnit, DiscoveryFilter,
    GatewayError, GatewayFuture, LaunchSpec, MetricQuery, ProviderGateway, UnitState, UnitStatus,
};
use crate::ids::{BidId, ProviderId};
use crate::price::Price;
use crate::transport::{
    CommandOutput, CommandRunner, Endpoint, ExecOutput, Transport, TransportError,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, TransportError> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| TransportError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Number of calls made to each [`ScriptedGateway`] operation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct GatewayCalls {
    /// Calls to `list_partitions`.
    pub list_partitions: usize,
    /// Calls to `latest_price`.
    pub latest_price: usize,
    /// Calls to `submit_bid`.
    pub submit_bid: usize,
    /// Calls to `describe_bids`.
    pub describe_bids: usize,
    /// Calls to `run_direct`.
    pub run_direct: usize,
    /// Calls to `describe_unit_states`.
    pub describe_unit_states: usize,
    /// Calls to `describe_address`.
    pub describe_address: usize,
    /// Calls to `discover_units`.
    pub discover_units: usize,
    /// Calls to `unit_metrics`.
    pub unit_metrics: usize,
}

#[derive(Debug, Default)]
struct GatewayScript {
    partitions: Vec<String>,
    prices: HashMap<String, Price>,
    tickets: VecDeque<Vec<BidTicket>>,
    bid_states: HashMap<BidId, VecDeque<(BidState, Option<ProviderId>)>>,
    direct_runs: VecDeque<Vec<ProviderId>>,
    unit_states: HashMap<ProviderId, VecDeque<UnitState>>,
    addresses: HashMap<ProviderId, String>,
    metrics: HashMap<(ProviderId, String), Vec<Datapoint>>,
    discovered: Vec<DiscoveredUnit>,
    failing_terminations: HashSet<ProviderId>,
    transient_failures: HashMap<&'static str, usize>,
    calls: GatewayCalls,
    submitted: Vec<BidRequest>,
    launched: Vec<LaunchSpec>,
    cancelled: Vec<BidId>,
    terminated: Vec<ProviderId>,
    rebooted: Vec<ProviderId>,
    tagged: Vec<(ProviderId, String)>,
}

impl GatewayScript {
    fn take_failure(&mut self, operation: &'static str) -> Result<(), GatewayError> {
        match self.transient_failures.get_mut(operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(GatewayError::transient(operation, "scripted failure"))
            }
            _ => Ok(()),
        }
    }
}

/// Pops the next scripted value, repeating the last one once the queue holds
/// a single entry.
fn advance<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

/// Provider double with scripted prices, bids, states and addresses.
#[derive(Clone, Debug, Default)]
pub struct ScriptedGateway {
    script: Arc<Mutex<GatewayScript>>,
}

impl ScriptedGateway {
    /// Creates a gateway with nothing scripted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the latest price reported for each partition of the region.
    pub fn set_prices(&self, prices: &[(&str, &str)]) {
        let mut script = lock(&self.script);
        script.partitions = prices.iter().map(|(zone, _)| (*zone).to_owned()).collect();
        script.prices = prices
            .iter()
            .filter_map(|(zone, price)| {
                price
                    .parse::<Price>()
                    .ok()
                    .map(|parsed| ((*zone).to_owned(), parsed))
            })
            .collect();
    }

    /// Queues the tickets returned by the next `submit_bid`.
    pub fn push_bid_tickets(&self, tickets: &[(&str, Option<&str>)]) {
        lock(&self.script).tickets.push_back(
            tickets
                .iter()
                .map(|(bid, provider)| BidTicket {
                    bid_id: BidId::from(*bid),
                    provider_id: provider.map(ProviderId::from),
                })
                .collect(),
        );
    }

    /// Scripts the successive states reported for a bid. The provider id is
    /// reported with every state other than `Open`. `NotFound` omits the bid
    /// from the description. The last state repeats.
    pub fn script_bid(&self, bid: &str, states: &[BidState], provider_id: Option<&str>) {
        let sequence = states
            .iter()
            .map(|state| {
                let reported = if *state == BidState::Open {
                    None
                } else {
                    provider_id.map(ProviderId::from)
                };
                (*state, reported)
            })
            .collect();
        lock(&self.script)
            .bid_states
            .insert(BidId::from(bid), sequence);
    }

    /// Queues the provider ids returned by the next `run_direct`.
    pub fn push_direct_run(&self, ids: &[&str]) {
        lock(&self.script)
            .direct_runs
            .push_back(ids.iter().copied().map(ProviderId::from).collect());
    }

    /// Scripts the successive status check states of a unit. `NotFound`
    /// omits the unit from the description. The last state repeats.
    pub fn script_unit(&self, provider_id: &str, states: &[UnitState]) {
        lock(&self.script)
            .unit_states
            .insert(ProviderId::from(provider_id), states.iter().copied().collect());
    }

    /// Sets the address reported for a unit.
    pub fn set_address(&self, provider_id: &str, address: &str) {
        lock(&self.script)
            .addresses
            .insert(ProviderId::from(provider_id), address.to_owned());
    }

    /// Sets the samples reported for a unit metric.
    pub fn set_metrics(&self, provider_id: &str, metric: &str, samples: Vec<Datapoint>) {
        lock(&self.script)
            .metrics
            .insert((ProviderId::from(provider_id), metric.to_owned()), samples);
    }

    /// Sets the units returned by `discover_units`.
    pub fn set_discovered(&self, units: &[(Option<&str>, Option<&str>)]) {
        lock(&self.script).discovered = units
            .iter()
            .map(|(provider, bid)| DiscoveredUnit {
                provider_id: provider.map(ProviderId::from),
                bid_id: bid.map(BidId::from),
            })
            .collect();
    }

    /// Makes every `terminate_unit` call for `provider_id` fail.
    pub fn fail_termination(&self, provider_id: &str) {
        lock(&self.script)
            .failing_terminations
            .insert(ProviderId::from(provider_id));
    }

    /// Makes the next `count` calls of `operation` fail transiently.
    pub fn fail_next(&self, operation: &'static str, count: usize) {
        lock(&self.script)
            .transient_failures
            .insert(operation, count);
    }

    /// Call counters.
    #[must_use]
    pub fn calls(&self) -> GatewayCalls {
        lock(&self.script).calls
    }

    /// Bid requests submitted so far.
    #[must_use]
    pub fn submitted_bids(&self) -> Vec<BidRequest> {
        lock(&self.script).submitted.clone()
    }

    /// Direct launches requested so far.
    #[must_use]
    pub fn direct_launches(&self) -> Vec<LaunchSpec> {
        lock(&self.script).launched.clone()
    }

    /// Bids cancelled so far.
    #[must_use]
    pub fn cancelled_bids(&self) -> Vec<BidId> {
        lock(&self.script).cancelled.clone()
    }

    /// Units terminated so far.
    #[must_use]
    pub fn terminated_units(&self) -> Vec<ProviderId> {
        lock(&self.script).terminated.clone()
    }

    /// Units rebooted so far.
    #[must_use]
    pub fn rebooted_units(&self) -> Vec<ProviderId> {
        lock(&self.script).rebooted.clone()
    }

    /// Name tags applied so far.
    #[must_use]
    pub fn tags(&self) -> Vec<(ProviderId, String)> {
        lock(&self.script).tagged.clone()
    }

    fn respond<'a, T: Send + 'a>(
        &self,
        operation: &'static str,
        respond: impl FnOnce(&mut GatewayScript) -> Result<T, GatewayError>,
    ) -> GatewayFuture<'a, T> {
        let mut script = lock(&self.script);
        let result = script
            .take_failure(operation)
            .and_then(|()| respond(&mut *script));
        Box::pin(ready(result))
    }
}

impl ProviderGateway for ScriptedGateway {
    fn list_partitions<'a>(&'a self, _region: &'a str) -> GatewayFuture<'a, Vec<String>> {
        self.respond("list_partitions", |script| {
            script.calls.list_partitions += 1;
            Ok(script.partitions.clone())
        })
    }

    fn latest_price<'a>(
        &'a self,
        _size: &'a str,
        _os: &'a str,
        partition: &'a str,
    ) -> GatewayFuture<'a, Option<Price>> {
        self.respond("latest_price", |script| {
            script.calls.latest_price += 1;
            Ok(script.prices.get(partition).copied())
        })
    }

    fn submit_bid<'a>(&'a self, request: &'a BidRequest) -> GatewayFuture<'a, Vec<BidTicket>> {
        self.respond("submit_bid", |script| {
            script.calls.submit_bid += 1;
            script.submitted.push(request.clone());
            Ok(script.tickets.pop_front().unwrap_or_default())
        })
    }

    fn describe_bids<'a>(&'a self, bids: &'a [BidId]) -> GatewayFuture<'a, Vec<BidDescription>> {
        self.respond("describe_bids", |script| {
            script.calls.describe_bids += 1;
            Ok(bids
                .iter()
                .filter_map(|bid| {
                    let (state, provider_id) = script.bid_states.get_mut(bid).and_then(advance)?;
                    (state != BidState::NotFound).then(|| BidDescription {
                        bid_id: bid.clone(),
                        state,
                        provider_id,
                    })
                })
                .collect())
        })
    }

    fn run_direct<'a>(&'a self, spec: &'a LaunchSpec) -> GatewayFuture<'a, Vec<ProviderId>> {
        self.respond("run_direct", |script| {
            script.calls.run_direct += 1;
            script.launched.push(spec.clone());
            Ok(script.direct_runs.pop_front().unwrap_or_default())
        })
    }

    fn describe_unit_states<'a>(
        &'a self,
        units: &'a [ProviderId],
    ) -> GatewayFuture<'a, Vec<UnitStatus>> {
        self.respond("describe_unit_states", |script| {
            script.calls.describe_unit_states += 1;
            Ok(units
                .iter()
                .filter_map(|unit| {
                    let state = script.unit_states.get_mut(unit).and_then(advance)?;
                    (state != UnitState::NotFound).then(|| UnitStatus {
                        provider_id: unit.clone(),
                        state,
                    })
                })
                .collect())
        })
    }

    fn describe_address<'a>(&'a self, unit: &'a ProviderId) -> GatewayFuture<'a, Option<String>> {
        self.respond("describe_address", |script| {
            script.calls.describe_address += 1;
            Ok(script.addresses.get(unit).cloned())
        })
    }

    fn cancel_bid<'a>(&'a self, bid: &'a BidId) -> GatewayFuture<'a, ()> {
        self.respond("cancel_bid", |script| {
            script.cancelled.push(bid.clone());
            Ok(())
        })
    }

    fn terminate_unit<'a>(&'a self, unit: &'a ProviderId) -> GatewayFuture<'a, ()> {
        self.respond("terminate_unit", |script| {
            if script.failing_terminations.contains(unit) {
                return Err(GatewayError::transient(
                    "terminate_unit",
                    format!("refused to terminate {unit}"),
                ));
            }
            script.terminated.push(unit.clone());
            Ok(())
        })
    }

    fn reboot_unit<'a>(&'a self, unit: &'a ProviderId) -> GatewayFuture<'a, ()> {
        self.respond("reboot_unit", |script| {
            script.rebooted.push(unit.clone());
            Ok(())
        })
    }

    fn tag_unit<'a>(&'a self, unit: &'a ProviderId, name: &'a str) -> GatewayFuture<'a, ()> {
        self.respond("tag_unit", |script| {
            script.tagged.push((unit.clone(), name.to_owned()));
            Ok(())
        })
    }

    fn discover_units<'a>(
        &'a self,
        _filter: &'a DiscoveryFilter,
    ) -> GatewayFuture<'a, Vec<DiscoveredUnit>> {
        self.respond("discover_units", |script| {
            script.calls.discover_units += 1;
            Ok(script.discovered.clone())
        })
    }

    fn unit_metrics<'a>(
        &'a self,
        unit: &'a ProviderId,
        query: &'a MetricQuery,
    ) -> GatewayFuture<'a, Vec<Datapoint>> {
        self.respond("unit_metrics", |script| {
            script.calls.unit_metrics += 1;
            Ok(script
                .metrics
                .get(&(unit.clone(), query.metric.clone()))
                .cloned()
                .unwrap_or_default())
        })
    }
}

/// Operation recorded by [`ScriptedTransport`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransportCall {
    /// A remote command.
    Exec {
        /// Target host.
        host: String,
        /// Command text.
        command: String,
    },
    /// An upload.
    Send {
        /// Target host.
        host: String,
        /// Local source path.
        local: Utf8PathBuf,
        /// Remote destination path.
        remote: String,
    },
    /// A single-file download.
    Download {
        /// Source host.
        host: String,
        /// Remote source path.
        remote: String,
        /// Local destination path.
        local: Utf8PathBuf,
    },
}

#[derive(Debug, Default)]
struct TransportScript {
    exec_responses: HashMap<String, VecDeque<Result<ExecOutput, TransportError>>>,
    unreachable_hosts: HashSet<String>,
    missing_remote: HashSet<String>,
    calls: Vec<TransportCall>,
}

/// Transport double. Commands succeed by default, echoing
/// `<host>: <command>`; downloads write a small file holding
/// `<host>:<remote>`.
#[derive(Clone, Debug, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<TransportScript>>,
}

impl ScriptedTransport {
    /// Creates a transport with nothing scripted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response for the next command run against `host`.
    pub fn push_exec(&self, host: &str, response: Result<ExecOutput, TransportError>) {
        lock(&self.script)
            .exec_responses
            .entry(host.to_owned())
            .or_default()
            .push_back(response);
    }

    /// Queues `count` failed probes (`exit 1`) against `host`.
    pub fn push_exec_failures(&self, host: &str, count: usize) {
        for _ in 0..count {
            self.push_exec(
                host,
                Ok(ExecOutput {
                    lines: vec![String::from("connection refused")],
                    exit_code: Some(1),
                }),
            );
        }
    }

    /// Makes every operation against `host` fail as unreachable.
    pub fn make_unreachable(&self, host: &str) {
        lock(&self.script).unreachable_hosts.insert(host.to_owned());
    }

    /// Marks a remote path as absent on every host.
    pub fn mark_missing(&self, remote: &str) {
        lock(&self.script).missing_remote.insert(remote.to_owned());
    }

    /// Every operation recorded so far.
    #[must_use]
    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.script).calls.clone()
    }

    /// Commands run against `host`, in order.
    #[must_use]
    pub fn commands_for(&self, host: &str) -> Vec<String> {
        lock(&self.script)
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Exec {
                    host: target,
                    command,
                } if target == host => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    fn check_reachable(script: &TransportScript, endpoint: &Endpoint) -> Result<(), TransportError> {
        endpoint.credentials.validate(&endpoint.host)?;
        if script.unreachable_hosts.contains(&endpoint.host) {
            return Err(TransportError::Unreachable {
                host: endpoint.host.clone(),
                message: String::from("scripted outage"),
            });
        }
        Ok(())
    }
}

impl Transport for ScriptedTransport {
    fn exec(&self, endpoint: &Endpoint, command: &str) -> Result<ExecOutput, TransportError> {
        let mut script = lock(&self.script);
        script.calls.push(TransportCall::Exec {
            host: endpoint.host.clone(),
            command: command.to_owned(),
        });
        Self::check_reachable(&script, endpoint)?;
        script
            .exec_responses
            .get_mut(&endpoint.host)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                Ok(ExecOutput {
                    lines: vec![format!("{}: {command}", endpoint.host)],
                    exit_code: Some(0),
                })
            })
    }

    fn send_file(
        &self,
        endpoint: &Endpoint,
        local: &Utf8Path,
        remote: &str,
    ) -> Result<(), TransportError> {
        let mut script = lock(&self.script);
        script.calls.push(TransportCall::Send {
            host: endpoint.host.clone(),
            local: local.to_path_buf(),
            remote: remote.to_owned(),
        });
        Self::check_reachable(&script, endpoint)
    }

    fn download(
        &self,
        endpoint: &Endpoint,
        remote: &str,
        local: &Utf8Path,
    ) -> Result<bool, TransportError> {
        let mut script = lock(&self.script);
        script.calls.push(TransportCall::Download {
            host: endpoint.host.clone(),
            remote: remote.to_owned(),
            local: local.to_path_buf(),
        });
        Self::check_reachable(&script, endpoint)?;
        if script.missing_remote.contains(remote) {
            return Ok(false);
        }

        let io_error = |err: std::io::Error| TransportError::Io {
            path: local.to_path_buf(),
            message: err.to_string(),
        };
        let parent = local
            .parent()
            .filter(|dir| !dir.as_str().is_empty())
            .unwrap_or_else(|| Utf8Path::new("."));
        let file_name = local.file_name().ok_or_else(|| TransportError::Io {
            path: local.to_path_buf(),
            message: String::from("destination has no file name"),
        })?;
        let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(io_error)?;
        dir.write(file_name, format!("{}:{remote}", endpoint.host))
            .map_err(io_error)?;
        Ok(true)
    }
}

#[derive(Debug)]
struct ClockState {
    elapsed: Duration,
    pauses: usize,
    interrupt_after: Option<usize>,
}

/// Clock whose pauses complete immediately while advancing simulated time.
#[derive(Clone, Debug)]
pub struct ManualClock {
    origin: Instant,
    state: Arc<Mutex<ClockState>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
            state: Arc::new(Mutex::new(ClockState {
                elapsed: Duration::ZERO,
                pauses: 0,
                interrupt_after: None,
            })),
        }
    }
}

impl ManualClock {
    /// Creates a clock at simulated time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrupts every pause after the first `pauses` have completed.
    pub fn interrupt_after(&self, pauses: usize) {
        lock(&self.state).interrupt_after = Some(pauses);
    }

    /// Number of pauses that completed.
    #[must_use]
    pub fn pauses(&self) -> usize {
        lock(&self.state).pauses
    }

    /// Simulated time elapsed so far.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        lock(&self.state).elapsed
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let elapsed = lock(&self.state).elapsed;
        self.origin.checked_add(elapsed).unwrap_or(self.origin)
    }

    fn pause(&self, duration: Duration) -> PauseFuture<'_> {
        let mut state = lock(&self.state);
        let result = if state
            .interrupt_after
            .is_some_and(|limit| state.pauses >= limit)
        {
            Err(Interrupted)
        } else {
            state.elapsed = state.elapsed.saturating_add(duration);
            state.pauses += 1;
            Ok(())
        };
        Box::pin(ready(result))
    }
}

/// Builds a fleet context over the scripted doubles, with keys under
/// `/keys`.
#[must_use]
pub fn scripted_context(
    gateway: &ScriptedGateway,
    transport: &ScriptedTransport,
    clock: &ManualClock,
) -> FleetContext {
    FleetContext::new(
        Arc::new(gateway.clone()),
        Arc::new(transport.clone()),
        Arc::new(clock.clone()),
    )
    .with_key_dir(Utf8PathBuf::from("/keys"))
}
