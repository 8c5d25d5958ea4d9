//! Management request processing.
//!
//! The coordinator splits an incoming request by owner, sends one
//! sub-request per owner (AgentX PDU for sessions, direct call for local
//! stores) and folds the answers back into a single response. Set runs the
//! four AgentX phases: TestSet, then CommitSet or UndoSet, then CleanupSet.

use std::{sync::Arc, time::Duration};

use tokio::{sync::oneshot, task::JoinSet};

use crate::{
    access::{AccessControl, SecurityParams, ViewType},
    codec::varbind_encoded_len,
    dispatch::{DispatchError, Dispatcher, SubResponse},
    local::MibStore,
    oid::{Oid, MAX_SUBIDS},
    pdu::{ErrorStatus, Payload, SearchRange, VarBind, VarBindValue},
    registry::{Owner, RegEntry, Registry},
    session::SessionManager,
};

/// Room reserved for the SNMP message wrapping a GetBulk response.
const RESPONSE_OVERHEAD: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Get,
    GetNext,
    GetBulk { non_repeaters: u16, max_repetitions: u16 },
    Set,
}

/// A request as handed over by the SNMP message layer.
#[derive(Debug, Clone)]
pub struct ManagementRequest {
    pub kind: RequestKind,
    pub context: Vec<u8>,
    pub varbinds: Vec<VarBind>,
    pub security: Option<SecurityParams>,
    /// View already resolved by the caller; consulted when `security` is absent.
    pub view: Option<String>,
    pub timeout: Option<Duration>,
}

impl ManagementRequest {
    pub fn new(kind: RequestKind, varbinds: Vec<VarBind>) -> Self {
        ManagementRequest {
            kind,
            context: Vec::new(),
            varbinds,
            security: None,
            view: None,
            timeout: None,
        }
    }

    /// A read request for the given OIDs.
    pub fn read(kind: RequestKind, oids: &[Oid]) -> Self {
        Self::new(kind, oids.iter().cloned().map(VarBind::null).collect())
    }

    pub fn with_context(mut self, context: impl Into<Vec<u8>>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_security(mut self, security: SecurityParams) -> Self {
        self.security = Some(security);
        self
    }

    pub fn with_view(mut self, view: impl Into<String>) -> Self {
        self.view = Some(view.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagementResponse {
    pub error_status: ErrorStatus,
    /// 1-based; 0 when the error is not tied to a varbind.
    pub error_index: u16,
    pub varbinds: Vec<VarBind>,
}

impl ManagementResponse {
    fn ok(varbinds: Vec<VarBind>) -> Self {
        ManagementResponse {
            error_status: ErrorStatus::NoError,
            error_index: 0,
            varbinds,
        }
    }

    fn error(error_status: ErrorStatus, error_index: u16, varbinds: Vec<VarBind>) -> Self {
        ManagementResponse {
            error_status,
            error_index,
            varbinds,
        }
    }
}

/// The positions of one request routed to one owner.
struct Group {
    entry: RegEntry,
    positions: Vec<usize>,
}

impl Group {
    /// Maps an owner's 1-based error index back to a request position.
    fn position_for(&self, index: u16) -> usize {
        let i = index as usize;
        if (1..=self.positions.len()).contains(&i) {
            self.positions[i - 1]
        } else {
            self.positions[0]
        }
    }
}

/// Adds `position` to the group of its owner and returns that group's index.
fn add_to_group(groups: &mut Vec<Group>, entry: RegEntry, position: usize) -> usize {
    let key = entry.owner.key();
    match groups.iter().position(|g| g.entry.owner.key() == key) {
        Some(slot) => {
            groups[slot].positions.push(position);
            slot
        }
        None => {
            groups.push(Group {
                entry,
                positions: vec![position],
            });
            groups.len() - 1
        }
    }
}

/// Earliest failing request position and its status.
#[derive(Debug, Default)]
struct Failures(Option<(usize, ErrorStatus)>);

impl Failures {
    fn record(&mut self, position: usize, status: ErrorStatus) {
        match self.0 {
            Some((first, _)) if first <= position => {}
            _ => self.0 = Some((position, status)),
        }
    }

    fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    fn merge(&mut self, other: Failures) {
        if let Some((position, status)) = other.0 {
            self.record(position, status);
        }
    }

    fn into_response(self, varbinds: Vec<VarBind>) -> ManagementResponse {
        match self.0 {
            Some((position, status)) => {
                ManagementResponse::error(status, position as u16 + 1, varbinds)
            }
            None => ManagementResponse::ok(varbinds),
        }
    }
}

/// One GetNext-style traversal for one request position.
struct Walk {
    position: usize,
    requested: Oid,
    cursor: Oid,
    include: bool,
    result: Option<VarBind>,
}

impl Walk {
    fn new(position: usize, oid: Oid) -> Self {
        Walk {
            position,
            requested: oid.clone(),
            cursor: oid,
            include: false,
            result: None,
        }
    }

    fn finish(&mut self) {
        self.result = Some(VarBind::new(self.requested.clone(), VarBindValue::EndOfMibView));
    }

    fn take(self) -> VarBind {
        self.result
            .unwrap_or_else(|| VarBind::new(self.requested, VarBindValue::EndOfMibView))
    }
}

fn wire_context(context: &[u8]) -> Option<Vec<u8>> {
    (!context.is_empty()).then(|| context.to_vec())
}

/// Unpacks an owner's answer carrying `expected` varbinds.
fn answers(reply: Result<SubResponse, DispatchError>, expected: usize) -> Result<Vec<VarBind>, ErrorStatus> {
    match reply {
        Ok(r) if r.error.is_error() => Err(r.error),
        Ok(r) if r.varbinds.len() != expected => Err(ErrorStatus::GenErr),
        Ok(r) => Ok(r.varbinds),
        Err(e) => Err(e.status()),
    }
}

fn accepted(reply: &Result<SubResponse, DispatchError>) -> bool {
    matches!(reply, Ok(r) if !r.error.is_error())
}

/// Answers a sub-request from a local store the way a subagent would.
fn serve_local(store: &dyn MibStore, transaction_id: u32, payload: &Payload) -> SubResponse {
    let ok = |varbinds| SubResponse {
        error: ErrorStatus::NoError,
        index: 0,
        varbinds,
    };
    let phase = |result: Result<(), crate::local::StoreError>| match result {
        Ok(()) => ok(Vec::new()),
        Err(e) => SubResponse {
            error: e.status,
            index: e.index,
            varbinds: Vec::new(),
        },
    };
    match payload {
        Payload::Get { ranges, .. } => ok(ranges
            .iter()
            .map(|r| VarBind::new(r.start.clone(), store.get(&r.start)))
            .collect()),
        Payload::GetNext { ranges, .. } => ok(ranges
            .iter()
            .map(|r| {
                store
                    .get_next(r)
                    .unwrap_or_else(|| VarBind::new(r.start.clone(), VarBindValue::EndOfMibView))
            })
            .collect()),
        Payload::TestSet { varbinds, .. } => phase(store.test_set(transaction_id, varbinds)),
        Payload::CommitSet => phase(store.commit_set(transaction_id)),
        Payload::UndoSet => phase(store.undo_set(transaction_id)),
        Payload::CleanupSet => {
            store.cleanup_set(transaction_id);
            ok(Vec::new())
        }
        _ => SubResponse {
            error: ErrorStatus::GenErr,
            index: 0,
            varbinds: Vec::new(),
        },
    }
}

fn abort_requested(abort: &mut Option<oneshot::Receiver<()>>) -> bool {
    matches!(abort.as_mut().map(|rx| rx.try_recv()), Some(Ok(())))
}

#[derive(Clone)]
pub struct Coordinator {
    registry: Arc<Registry>,
    sessions: Arc<SessionManager>,
    dispatcher: Arc<Dispatcher>,
    access: Arc<dyn AccessControl>,
    default_timeout: Duration,
    max_response_size: usize,
}

impl Coordinator {
    pub fn new(
        registry: Arc<Registry>,
        sessions: Arc<SessionManager>,
        dispatcher: Arc<Dispatcher>,
        access: Arc<dyn AccessControl>,
        default_timeout: Duration,
        max_response_size: usize,
    ) -> Self {
        Coordinator {
            registry,
            sessions,
            dispatcher,
            access,
            default_timeout,
            max_response_size,
        }
    }

    /// Runs any kind of request.
    pub async fn process(&self, request: &ManagementRequest) -> ManagementResponse {
        if let Some(i) = request.varbinds.iter().position(|vb| vb.oid.len() > MAX_SUBIDS) {
            return ManagementResponse::error(ErrorStatus::GenErr, i as u16 + 1, request.varbinds.clone());
        }
        match request.kind {
            RequestKind::Get => self.get(request).await,
            RequestKind::GetNext => self.get_next(request).await,
            RequestKind::GetBulk {
                non_repeaters,
                max_repetitions,
            } => self.get_bulk(request, non_repeaters, max_repetitions).await,
            RequestKind::Set => self.set(request).await,
        }
    }

    fn allowed(&self, request: &ManagementRequest, view: ViewType, oid: &Oid) -> bool {
        let decision = match (&request.security, &request.view) {
            (Some(params), _) => self.access.is_access_allowed(params, view, &request.context, oid),
            (None, Some(name)) => self.access.is_access_allowed_in_view(name, oid),
            (None, None) => return true,
        };
        decision.is_allowed()
    }

    /// Sends one sub-request to the owner of `entry` and waits for its
    /// answer.
    async fn exchange(
        &self,
        entry: &RegEntry,
        transaction_id: u32,
        payload: Payload,
        timeout: Option<Duration>,
    ) -> Result<SubResponse, DispatchError> {
        let session_id = match &entry.owner {
            Owner::Local(handle) => return Ok(serve_local(handle.store(), transaction_id, &payload)),
            Owner::Remote { session_id, .. } => *session_id,
        };
        let route = self
            .sessions
            .route(session_id)
            .map_err(|_| DispatchError::Unreachable(session_id))?;
        let deadline = timeout
            .or_else(|| (entry.timeout > 0).then(|| Duration::from_secs(entry.timeout as u64)))
            .or(route.timeout)
            .unwrap_or(self.default_timeout);

        let reply = self
            .dispatcher
            .request(&route, transaction_id, payload, deadline)
            .await;
        match &reply {
            Ok(_) => self.sessions.record_success(session_id),
            Err(DispatchError::Timeout(_)) => {
                let count = self.sessions.record_timeout(session_id);
                log::warn!(
                    "Session {} did not answer within {:?} ({} consecutive timeouts)",
                    session_id,
                    deadline,
                    count
                );
            }
            Err(e) => log::debug!("Sub-request to session {} failed: {}", session_id, e),
        }
        reply
    }

    /// Runs `jobs` concurrently; results come back in job order.
    async fn fan_out(
        &self,
        jobs: Vec<(RegEntry, Payload)>,
        transaction_id: u32,
        timeout: Option<Duration>,
    ) -> Vec<Result<SubResponse, DispatchError>> {
        let mut results: Vec<Option<Result<SubResponse, DispatchError>>> =
            (0..jobs.len()).map(|_| None).collect();
        let mut set = JoinSet::new();
        for (i, (entry, payload)) in jobs.into_iter().enumerate() {
            let this = self.clone();
            set.spawn(async move { (i, this.exchange(&entry, transaction_id, payload, timeout).await) });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((i, reply)) => results[i] = Some(reply),
                Err(e) => log::error!("Sub-request task failed: {}", e),
            }
        }
        results
            .into_iter()
            .map(|r| r.unwrap_or(Err(DispatchError::Cancelled)))
            .collect()
    }

    async fn cleanup(&self, entry: &RegEntry, transaction_id: u32) {
        match &entry.owner {
            Owner::Local(handle) => handle.store().cleanup_set(transaction_id),
            Owner::Remote { session_id, .. } => {
                let Ok(route) = self.sessions.route(*session_id) else {
                    log::debug!("Session {} gone before CleanupSet", session_id);
                    return;
                };
                if let Err(e) = self.dispatcher.post(&route, transaction_id, Payload::CleanupSet).await {
                    log::warn!("CleanupSet to session {} failed: {}", session_id, e);
                }
            }
        }
    }

    pub async fn get(&self, request: &ManagementRequest) -> ManagementResponse {
        let context = &request.context;
        let mut varbinds: Vec<VarBind> = request
            .varbinds
            .iter()
            .map(|vb| VarBind::new(vb.oid.clone(), VarBindValue::NoSuchObject))
            .collect();

        let mut groups = Vec::new();
        for (i, vb) in request.varbinds.iter().enumerate() {
            if !self.allowed(request, ViewType::Read, &vb.oid) {
                continue;
            }
            if let Some(entry) = self.registry.owner_of(context, &vb.oid) {
                add_to_group(&mut groups, entry, i);
            }
        }

        let transaction_id = self.dispatcher.generate_transaction_id();
        let jobs = groups
            .iter()
            .map(|g| {
                let ranges = g
                    .positions
                    .iter()
                    .map(|&i| SearchRange::new(request.varbinds[i].oid.clone(), None, false))
                    .collect();
                let payload = Payload::Get {
                    context: wire_context(context),
                    ranges,
                };
                (g.entry.clone(), payload)
            })
            .collect();
        let replies = self.fan_out(jobs, transaction_id, request.timeout).await;

        let mut failures = Failures::default();
        for (group, reply) in groups.iter().zip(replies) {
            match answers(reply, group.positions.len()) {
                Ok(values) => {
                    for (&i, vb) in group.positions.iter().zip(values) {
                        varbinds[i].value = vb.value;
                    }
                }
                Err(status) => {
                    for &i in &group.positions {
                        varbinds[i].value = VarBindValue::Null;
                        failures.record(i, status);
                    }
                }
            }
        }
        failures.into_response(varbinds)
    }

    pub async fn get_next(&self, request: &ManagementRequest) -> ManagementResponse {
        let mut walks: Vec<Walk> = request
            .varbinds
            .iter()
            .enumerate()
            .map(|(i, vb)| Walk::new(i, vb.oid.clone()))
            .collect();
        let transaction_id = self.dispatcher.generate_transaction_id();
        let failures = self.walk(request, transaction_id, &mut walks).await;
        failures.into_response(walks.into_iter().map(Walk::take).collect())
    }

    /// Advances every unfinished walk to its next visible object, in rounds.
    /// Each round sends one GetNext per owner; a walk whose owner reports the
    /// end of its range moves on to the next owner's range.
    async fn walk(&self, request: &ManagementRequest, transaction_id: u32, walks: &mut [Walk]) -> Failures {
        let context = &request.context;
        let mut failures = Failures::default();
        loop {
            let mut groups: Vec<Group> = Vec::new();
            let mut ranges: Vec<Vec<(SearchRange, Option<Oid>)>> = Vec::new();
            for (w, walk) in walks.iter_mut().enumerate() {
                if walk.result.is_some() {
                    continue;
                }
                let Some(route) = self.registry.route_next(context, &walk.cursor, walk.include) else {
                    walk.finish();
                    continue;
                };
                let range = SearchRange::new(route.start, route.end.clone(), route.include);
                let slot = add_to_group(&mut groups, route.entry, w);
                if slot == ranges.len() {
                    ranges.push(Vec::new());
                }
                ranges[slot].push((range, route.end));
            }
            if groups.is_empty() {
                return failures;
            }

            let jobs = groups
                .iter()
                .zip(&ranges)
                .map(|(g, rs)| {
                    let payload = Payload::GetNext {
                        context: wire_context(context),
                        ranges: rs.iter().map(|(r, _)| r.clone()).collect(),
                    };
                    (g.entry.clone(), payload)
                })
                .collect();
            let replies = self.fan_out(jobs, transaction_id, request.timeout).await;

            for ((group, rs), reply) in groups.iter().zip(ranges).zip(replies) {
                match answers(reply, group.positions.len()) {
                    Err(status) => {
                        for &w in &group.positions {
                            let walk = &mut walks[w];
                            walk.result = Some(VarBind::null(walk.requested.clone()));
                            failures.record(walk.position, status);
                        }
                    }
                    Ok(values) => {
                        for ((&w, (range, end)), vb) in group.positions.iter().zip(rs).zip(values) {
                            let walk = &mut walks[w];
                            if vb.value.is_exception() || !range.admits(&vb.oid) {
                                match end {
                                    Some(end) => {
                                        walk.cursor = end;
                                        walk.include = true;
                                    }
                                    None => walk.finish(),
                                }
                            } else if !self.allowed(request, ViewType::Read, &vb.oid) {
                                walk.cursor = vb.oid;
                                walk.include = false;
                            } else {
                                walk.result = Some(vb);
                            }
                        }
                    }
                }
            }
        }
    }

    pub async fn get_bulk(
        &self,
        request: &ManagementRequest,
        non_repeaters: u16,
        max_repetitions: u16,
    ) -> ManagementResponse {
        let n = (non_repeaters as usize).min(request.varbinds.len());
        let transaction_id = self.dispatcher.generate_transaction_id();
        let mut size = RESPONSE_OVERHEAD;
        let mut out = Vec::new();

        let mut walks: Vec<Walk> = request.varbinds[..n]
            .iter()
            .enumerate()
            .map(|(i, vb)| Walk::new(i, vb.oid.clone()))
            .collect();
        let mut failures = self.walk(request, transaction_id, &mut walks).await;
        for vb in walks.into_iter().map(Walk::take) {
            size += varbind_encoded_len(&vb);
            out.push(vb);
        }
        if size > self.max_response_size {
            return ManagementResponse::error(ErrorStatus::TooBig, 0, request.varbinds.clone());
        }

        let repeaters = &request.varbinds[n..];
        let mut cursors: Vec<Oid> = repeaters.iter().map(|vb| vb.oid.clone()).collect();
        let mut ended = vec![false; repeaters.len()];

        'rows: for _ in 0..max_repetitions {
            if ended.iter().all(|e| *e) {
                break;
            }
            let mut walks: Vec<Walk> = cursors
                .iter()
                .enumerate()
                .filter(|(j, _)| !ended[*j])
                .map(|(j, oid)| Walk::new(n + j, oid.clone()))
                .collect();
            let round = self.walk(request, transaction_id, &mut walks).await;
            let round_failed = !round.is_empty();
            failures.merge(round);
            let mut results = walks.into_iter().map(|w| (w.position - n, w.take()));

            let mut next = results.next();
            for j in 0..repeaters.len() {
                let vb = match next.take() {
                    Some((k, vb)) if k == j => {
                        next = results.next();
                        vb
                    }
                    other => {
                        next = other;
                        VarBind::new(cursors[j].clone(), VarBindValue::EndOfMibView)
                    }
                };
                match vb.value {
                    VarBindValue::EndOfMibView => ended[j] = true,
                    VarBindValue::Null => {}
                    _ => cursors[j] = vb.oid.clone(),
                }
                let len = varbind_encoded_len(&vb);
                if size + len > self.max_response_size {
                    break 'rows;
                }
                size += len;
                out.push(vb);
            }
            if round_failed {
                break;
            }
        }
        failures.into_response(out)
    }

    pub async fn set(&self, request: &ManagementRequest) -> ManagementResponse {
        self.run_set(request, None).await
    }

    /// Like [`Coordinator::set`], but undoes instead of committing if
    /// `abort` fires before the commit phase.
    pub async fn set_with_abort(
        &self,
        request: &ManagementRequest,
        abort: oneshot::Receiver<()>,
    ) -> ManagementResponse {
        self.run_set(request, Some(abort)).await
    }

    async fn run_set(
        &self,
        request: &ManagementRequest,
        mut abort: Option<oneshot::Receiver<()>>,
    ) -> ManagementResponse {
        let echo = request.varbinds.clone();
        let mut groups = Vec::new();
        for (i, vb) in request.varbinds.iter().enumerate() {
            if !self.allowed(request, ViewType::Write, &vb.oid) {
                return ManagementResponse::error(ErrorStatus::NoAccess, i as u16 + 1, echo);
            }
            match self.registry.owner_of(&request.context, &vb.oid) {
                Some(entry) => {
                    add_to_group(&mut groups, entry, i);
                }
                None => return ManagementResponse::error(ErrorStatus::NotWritable, i as u16 + 1, echo),
            }
        }
        if groups.is_empty() {
            return ManagementResponse::ok(echo);
        }

        let transaction_id = self.dispatcher.generate_transaction_id();
        let timeout = request.timeout;

        // Prepare
        let jobs = groups
            .iter()
            .map(|g| {
                let payload = Payload::TestSet {
                    context: wire_context(&request.context),
                    varbinds: g.positions.iter().map(|&i| request.varbinds[i].clone()).collect(),
                };
                (g.entry.clone(), payload)
            })
            .collect();
        let replies = self.fan_out(jobs, transaction_id, timeout).await;
        let mut failures = Failures::default();
        let mut prepared = Vec::new();
        for (g, (group, reply)) in groups.iter().zip(replies).enumerate() {
            match reply {
                Ok(r) if !r.error.is_error() => prepared.push(g),
                Ok(r) => failures.record(group.position_for(r.index), r.error),
                Err(e) => failures.record(group.positions[0], e.status()),
            }
        }

        let aborted = abort_requested(&mut abort);
        let response = if !failures.is_empty() || aborted {
            log::debug!(
                "Set transaction {} not committed (aborted: {})",
                transaction_id,
                aborted
            );
            match self.undo(&groups, &prepared, transaction_id, timeout).await {
                Some(position) => {
                    ManagementResponse::error(ErrorStatus::UndoFailed, position as u16 + 1, echo)
                }
                None if aborted && failures.is_empty() => {
                    ManagementResponse::error(ErrorStatus::GenErr, 0, echo)
                }
                None => failures.into_response(echo),
            }
        } else {
            self.commit(&groups, transaction_id, timeout, echo).await
        };

        for group in &groups {
            self.cleanup(&group.entry, transaction_id).await;
        }
        response
    }

    /// Sends CommitSet to every owner at once. Every prepared owner has then
    /// seen its CommitSet, so a failure is reported but nothing is undone.
    async fn commit(
        &self,
        groups: &[Group],
        transaction_id: u32,
        timeout: Option<Duration>,
        echo: Vec<VarBind>,
    ) -> ManagementResponse {
        let jobs = groups
            .iter()
            .map(|g| (g.entry.clone(), Payload::CommitSet))
            .collect();
        let replies = self.fan_out(jobs, transaction_id, timeout).await;
        let failed = groups
            .iter()
            .zip(&replies)
            .filter(|(_, reply)| !accepted(reply))
            .map(|(group, _)| group.positions[0])
            .min();
        match failed {
            Some(position) => {
                log::error!(
                    "CommitSet failed for transaction {} at varbind {}",
                    transaction_id,
                    position + 1
                );
                ManagementResponse::error(ErrorStatus::CommitFailed, position as u16 + 1, echo)
            }
            None => ManagementResponse::ok(echo),
        }
    }

    /// Sends UndoSet to `targets`; returns the first position of an owner
    /// that failed to undo.
    async fn undo(
        &self,
        groups: &[Group],
        targets: &[usize],
        transaction_id: u32,
        timeout: Option<Duration>,
    ) -> Option<usize> {
        let jobs = targets
            .iter()
            .map(|&g| (groups[g].entry.clone(), Payload::UndoSet))
            .collect();
        let replies = self.fan_out(jobs, transaction_id, timeout).await;
        let mut failed = None;
        for (&g, reply) in targets.iter().zip(replies) {
            if !accepted(&reply) {
                log::error!(
                    "UndoSet failed for transaction {} at varbind {}",
                    transaction_id,
                    groups[g].positions[0] + 1
                );
                failed = failed.or(Some(groups[g].positions[0]));
            }
        }
        failed
    }
}
