//! The resolution engine: turn manifest roots into a fully pinned closure.
//!
//! Decision logic is single-threaded and synchronous; the only suspension
//! points are metadata fetches, which run through the scheduler and cache.
//! The output is a pure function of the manifest, the configuration, and
//! the provider's answers, independent of fetch completion order.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use petrel_lock::{LockedPackage, Lockfile, Pin};
use petrel_manifest::{Manifest, Section};
use petrel_normalize::{ExtraName, PackageName};
use petrel_spec::{
    MarkerKey, MarkerTree, Requirement, RequirementSource, Version, VersionSpecifiers,
};

use crate::cache::{FetchCache, Fetched, SourceKey};
use crate::candidate_selector::CandidateSelector;
use crate::error::{ConflictError, NoCandidateError, RequirementChain, ResolveError};
use crate::provider::{Candidate, MetadataProvider};
use crate::scheduler::{FetchRequest, FetchScheduler};
use crate::ResolverConfig;

/// The result of a successful resolution: one fully pinned closure per
/// manifest section, plus the requires-graph over their union.
///
/// Produced whole or not at all; a failed resolution returns an error and
/// leaves nothing behind for a caller to write.
#[derive(Debug)]
pub struct Resolution {
    pub default: BTreeMap<PackageName, LockedPackage>,
    pub develop: BTreeMap<PackageName, LockedPackage>,
    pub graph: DiGraph<PackageName, String>,
}

impl Resolution {
    /// Convert into a lockfile stamped with the manifest's fingerprint.
    pub fn into_lockfile(self, manifest: &Manifest) -> Lockfile {
        Lockfile::new(
            manifest.fingerprint(),
            manifest.sources.clone(),
            self.default,
            self.develop,
        )
    }
}

pub struct Resolver<'a, Provider: MetadataProvider> {
    manifest: &'a Manifest,
    config: ResolverConfig,
    provider: &'a Provider,
    cache: FetchCache,
}

/// A requirement awaiting processing, with the chain that introduced it.
#[derive(Debug, Clone)]
struct PendingRequirement {
    requirement: Requirement,
    chain: RequirementChain,
}

/// One accumulated version constraint on a name.
#[derive(Debug, Clone)]
struct TrackedConstraint {
    specifiers: VersionSpecifiers,
    chain: RequirementChain,
}

/// A chosen candidate for a name.
#[derive(Debug, Clone)]
struct Decision {
    candidate: Candidate,
    source: RequirementSource,
    /// The chain of the requirement that introduced the decision.
    chain: RequirementChain,
    /// The extras that were active when sub-requirements were expanded.
    expanded_extras: BTreeSet<ExtraName>,
}

/// Whether a package's presence in the closure is marker-conditional.
#[derive(Debug, Clone)]
enum MarkerStatus {
    /// Every requirement seen so far carried an environment marker.
    Conditional(Vec<MarkerTree>),
    /// At least one requirement applies unconditionally.
    Unconditional,
}

/// The engine's mutable state. Cloned wholesale into decision frames so
/// that backtracking is a restore, not an unwind.
#[derive(Debug, Clone, Default)]
struct State {
    pending: VecDeque<PendingRequirement>,
    /// Constraints accumulate at enqueue time, so selection always sees the
    /// full intersection known so far, popped or not.
    constraints: FxHashMap<PackageName, Vec<TrackedConstraint>>,
    extras: FxHashMap<PackageName, BTreeSet<ExtraName>>,
    markers: FxHashMap<PackageName, MarkerStatus>,
    decided: FxHashMap<PackageName, Decision>,
}

/// A registry decision point on the explicit backtracking stack.
#[derive(Debug)]
struct Frame {
    name: PackageName,
    version: Version,
    /// State just before the decision, with the triggering requirement
    /// queued back at the front for replay.
    snapshot: State,
}

impl State {
    fn enqueue(&mut self, requirement: Requirement, chain: RequirementChain) {
        if let Some(name) = requirement.name.clone() {
            if let Some(specifiers) = requirement.specifiers() {
                self.constraints
                    .entry(name.clone())
                    .or_default()
                    .push(TrackedConstraint {
                        specifiers: specifiers.clone(),
                        chain: chain.clone(),
                    });
            }
            self.absorb(&name, &requirement);
        }
        trace!("Queueing {chain}");
        self.pending.push_back(PendingRequirement { requirement, chain });
    }

    /// Fold a requirement's extras and marker into the per-name records.
    fn absorb(&mut self, name: &PackageName, requirement: &Requirement) {
        if !requirement.extras.is_empty() {
            self.extras
                .entry(name.clone())
                .or_default()
                .extend(requirement.extras.iter().cloned());
        }
        let status = self
            .markers
            .entry(name.clone())
            .or_insert_with(|| MarkerStatus::Conditional(Vec::new()));
        match &requirement.marker {
            // An extra-guarded requirement was admitted because the extra is
            // active, so its presence is unconditional at install time.
            Some(marker) if !mentions_extra(marker) => {
                if let MarkerStatus::Conditional(markers) = status {
                    if !markers.contains(marker) {
                        markers.push(marker.clone());
                    }
                }
            }
            _ => *status = MarkerStatus::Unconditional,
        }
    }
}

impl<'a, Provider: MetadataProvider> Resolver<'a, Provider> {
    pub fn new(manifest: &'a Manifest, config: ResolverConfig, provider: &'a Provider) -> Self {
        Self {
            manifest,
            config,
            provider,
            cache: FetchCache::default(),
        }
    }

    /// Resolve both manifest sections.
    ///
    /// The sections are independent closures; a package rooted in both
    /// appears in both partitions. The fetch cache is shared, so metadata
    /// common to the two closures is fetched once.
    pub async fn resolve(&self) -> Result<Resolution, ResolveError> {
        let default = self.resolve_section(Section::Default).await?;
        let develop = self.resolve_section(Section::Develop).await?;
        let graph = requires_graph([&default, &develop]);
        Ok(Resolution {
            default,
            develop,
            graph,
        })
    }

    async fn resolve_section(
        &self,
        section: Section,
    ) -> Result<BTreeMap<PackageName, LockedPackage>, ResolveError> {
        let scheduler = FetchScheduler::new(self.provider, &self.cache, &self.config);

        let mut state = State::default();
        // Pinned roots first: they are fixed points that later constraints
        // validate against rather than replace.
        let (pinned, registry): (Vec<&Requirement>, Vec<&Requirement>) = self
            .manifest
            .section(section)
            .partition(|requirement| requirement.source.is_pinned());
        for requirement in pinned.into_iter().chain(registry) {
            let chain = RequirementChain::root(chain_link(requirement));
            state.enqueue(requirement.clone(), chain);
        }

        let mut frames: Vec<Frame> = Vec::new();
        let mut rejected: FxHashMap<PackageName, BTreeSet<Version>> = FxHashMap::default();

        loop {
            self.prefetch(&scheduler, &state).await?;
            let Some(item) = state.pending.pop_front() else {
                break;
            };
            match SourceKey::pinned(&item.requirement.source) {
                Some(key) => {
                    self.process_pinned(&scheduler, &mut state, item, key)
                        .await?;
                }
                None => {
                    self.process_registry(&scheduler, &mut state, &mut frames, &mut rejected, item)
                        .await?;
                }
            }
        }

        Ok(Self::finalize(&state))
    }

    /// Fetch metadata for everything pending in one batch, so independent
    /// queries overlap up to the worker budget.
    async fn prefetch(
        &self,
        scheduler: &FetchScheduler<'_, Provider>,
        state: &State,
    ) -> Result<(), ResolveError> {
        let mut seen = FxHashSet::default();
        let mut requests = Vec::new();
        for item in &state.pending {
            let request = match SourceKey::pinned(&item.requirement.source) {
                Some(key) => FetchRequest::Pinned {
                    key,
                    requirement: item.requirement.clone(),
                },
                None => match &item.requirement.name {
                    Some(name) if !state.decided.contains_key(name) => {
                        FetchRequest::Index(name.clone())
                    }
                    _ => continue,
                },
            };
            let key = request.key();
            if self.cache.get(&key).is_some() || !seen.insert(key) {
                continue;
            }
            requests.push(request);
        }
        if requests.is_empty() {
            return Ok(());
        }
        for outcome in scheduler.schedule(requests).await {
            if let Err(err) = outcome.as_ref() {
                // The rest of the batch has already run to completion; its
                // results are discarded along with this return.
                return Err(err.clone());
            }
        }
        Ok(())
    }

    async fn process_pinned(
        &self,
        scheduler: &FetchScheduler<'_, Provider>,
        state: &mut State,
        item: PendingRequirement,
        key: SourceKey,
    ) -> Result<(), ResolveError> {
        let outcome = scheduler
            .fetch_one(FetchRequest::Pinned {
                key: key.clone(),
                requirement: item.requirement.clone(),
            })
            .await;
        let candidate = match outcome.as_ref() {
            Ok(Fetched::Pinned(candidate)) => candidate.clone(),
            Ok(Fetched::Candidates(_)) => {
                return Err(ResolveError::Metadata(
                    key.to_string(),
                    "expected a single pinned candidate".to_string(),
                ));
            }
            Err(err) => return Err(err.clone()),
        };

        // The fetched metadata is authoritative for the name.
        if let Some(given) = &item.requirement.name {
            if *given != candidate.name {
                return Err(ResolveError::NameMismatch {
                    given: given.clone(),
                    metadata: candidate.name.clone(),
                });
            }
        }
        let name = candidate.name.clone();
        if item.requirement.name.is_none() {
            // Late-bind the bookkeeping the named path does at enqueue time.
            state.absorb(&name, &item.requirement);
        }

        let existing = state
            .decided
            .get(&name)
            .map(|decision| (decision.source.clone(), decision.chain.clone()));
        match existing {
            Some((source, _)) if source == item.requirement.source => {
                expand_extras(state, &name);
                Ok(())
            }
            Some((_, chain)) => Err(ConflictError {
                name,
                chains: vec![chain, item.chain.clone()],
            }
            .into()),
            None => {
                // A fixed point: every accumulated constraint must admit it.
                if let Some(violated) = state.constraints.get(&name).and_then(|tracked| {
                    tracked
                        .iter()
                        .find(|tracked| !tracked.specifiers.contains(&candidate.version))
                }) {
                    return Err(ConflictError {
                        name,
                        chains: vec![violated.chain.clone(), item.chain.clone()],
                    }
                    .into());
                }
                apply_decision(state, &name, candidate, &item);
                Ok(())
            }
        }
    }

    async fn process_registry(
        &self,
        scheduler: &FetchScheduler<'_, Provider>,
        state: &mut State,
        frames: &mut Vec<Frame>,
        rejected: &mut FxHashMap<PackageName, BTreeSet<Version>>,
        item: PendingRequirement,
    ) -> Result<(), ResolveError> {
        let Some(name) = item.requirement.name.clone() else {
            return Err(ResolveError::Metadata(
                item.chain.to_string(),
                "a registry requirement must be named".to_string(),
            ));
        };

        let decided = state.decided.get(&name).map(|decision| {
            (
                decision.candidate.version.clone(),
                decision.source.is_pinned(),
                decision.chain.clone(),
            )
        });
        if let Some((version, pinned, chain)) = decided {
            let satisfied = item
                .requirement
                .specifiers()
                .map_or(true, |specifiers| specifiers.contains(&version));
            if satisfied {
                // Edge accepted; newly requested extras may add work.
                expand_extras(state, &name);
                return Ok(());
            }
            if pinned {
                // Fixed points are validated against, never replaced.
                return Err(ConflictError {
                    name,
                    chains: vec![chain, item.chain.clone()],
                }
                .into());
            }
            debug!("Constraint {} rejects decided {name}=={version}", item.chain);
            return Self::backtrack(state, frames, rejected, &name, version, &item);
        }

        let outcome = scheduler.fetch_one(FetchRequest::Index(name.clone())).await;
        let candidates = match outcome.as_ref() {
            Ok(Fetched::Candidates(candidates)) => candidates,
            Ok(Fetched::Pinned(_)) => {
                return Err(ResolveError::Metadata(
                    name.to_string(),
                    "expected an index response".to_string(),
                ));
            }
            Err(err) => return Err(err.clone()),
        };

        // Selection runs against the full intersection accumulated so far,
        // including constraints that are still queued.
        let tracked = state.constraints.get(&name).cloned().unwrap_or_default();
        let specifiers: Vec<&VersionSpecifiers> = tracked
            .iter()
            .map(|tracked| &tracked.specifiers)
            .collect();
        let banned = rejected.get(&name);
        match CandidateSelector::select(candidates, &specifiers, banned) {
            Some(candidate) => {
                let candidate = candidate.clone();
                let mut snapshot = state.clone();
                snapshot.pending.push_front(item.clone());
                frames.push(Frame {
                    name: name.clone(),
                    version: candidate.version.clone(),
                    snapshot,
                });
                apply_decision(state, &name, candidate, &item);
                Ok(())
            }
            None => Err(Self::no_candidate(&name, candidates, &tracked)),
        }
    }

    /// Reject the decided version and restore the state captured just
    /// before it was chosen. Replay then re-decides the name against
    /// whatever constraints re-accumulate, with the rejected version (and
    /// any rejected earlier) out of consideration.
    fn backtrack(
        state: &mut State,
        frames: &mut Vec<Frame>,
        rejected: &mut FxHashMap<PackageName, BTreeSet<Version>>,
        name: &PackageName,
        version: Version,
        item: &PendingRequirement,
    ) -> Result<(), ResolveError> {
        let Some(position) = frames.iter().rposition(|frame| frame.name == *name) else {
            // No decision frame to revisit; report the competing chains.
            let mut chains: Vec<RequirementChain> = state
                .constraints
                .get(name)
                .map(|tracked| tracked.iter().map(|tracked| tracked.chain.clone()).collect())
                .unwrap_or_default();
            if !chains.contains(&item.chain) {
                chains.push(item.chain.clone());
            }
            return Err(ConflictError {
                name: name.clone(),
                chains,
            }
            .into());
        };

        rejected
            .entry(name.clone())
            .or_default()
            .insert(version.clone());
        let frame = frames.remove(position);
        // Decisions made after the frame are implicitly unwound by the
        // restore; drop their frames too.
        frames.truncate(position);
        debug!(
            "Backtracking to re-decide {name} (rejecting {name}=={version}); replaying {} queued requirement(s)",
            frame.snapshot.pending.len()
        );
        *state = frame.snapshot;
        Ok(())
    }

    /// Classify a failed selection: constraints that are individually (or
    /// jointly, before rejections) satisfiable are a conflict; anything
    /// else means the index simply has no matching version.
    fn no_candidate(
        name: &PackageName,
        candidates: &[Candidate],
        tracked: &[TrackedConstraint],
    ) -> ResolveError {
        let chains: Vec<RequirementChain> =
            tracked.iter().map(|tracked| tracked.chain.clone()).collect();
        let allow_prerelease = tracked
            .iter()
            .any(|tracked| tracked.specifiers.any_prerelease());
        let eligible = |candidate: &&Candidate| {
            allow_prerelease || !candidate.version.any_prerelease()
        };

        let intersection_satisfiable = candidates.iter().filter(eligible).any(|candidate| {
            tracked
                .iter()
                .all(|tracked| tracked.specifiers.contains(&candidate.version))
        });
        let individually_satisfiable = tracked.len() > 1
            && tracked.iter().all(|tracked| {
                candidates
                    .iter()
                    .filter(eligible)
                    .any(|candidate| tracked.specifiers.contains(&candidate.version))
            });

        if intersection_satisfiable || individually_satisfiable {
            ConflictError {
                name: name.clone(),
                chains,
            }
            .into()
        } else {
            NoCandidateError {
                name: name.clone(),
                constraints: render_intersection(tracked),
                chains,
            }
            .into()
        }
    }

    /// Convert the decided set into locked packages with requires-edges.
    fn finalize(state: &State) -> BTreeMap<PackageName, LockedPackage> {
        let mut packages = BTreeMap::new();
        for (name, decision) in &state.decided {
            let active: Vec<ExtraName> = state
                .extras
                .get(name)
                .map(|extras| extras.iter().cloned().collect())
                .unwrap_or_default();

            let mut requires = BTreeMap::new();
            for sub in &decision.candidate.requires {
                if !gate(sub, &active) {
                    continue;
                }
                let Some(target) = &sub.name else { continue };
                if target == name || !state.decided.contains_key(target) {
                    continue;
                }
                requires.insert(target.clone(), constraint_text(sub));
            }

            let pin = match &decision.source {
                RequirementSource::Registry { .. } => {
                    Pin::Version(decision.candidate.version.clone())
                }
                RequirementSource::Vcs {
                    kind,
                    url,
                    reference,
                    ..
                } => Pin::Vcs {
                    kind: *kind,
                    url: url.clone(),
                    reference: decision
                        .candidate
                        .reference
                        .clone()
                        .or_else(|| reference.clone()),
                },
                RequirementSource::Url { url } => Pin::Url { url: url.clone() },
                RequirementSource::Path { path, .. } => Pin::Path {
                    path: path.display().to_string(),
                },
            };

            let marker = match state.markers.get(name) {
                Some(MarkerStatus::Conditional(markers)) if !markers.is_empty() => {
                    Some(combine_markers(markers))
                }
                _ => None,
            };

            packages.insert(
                name.clone(),
                LockedPackage {
                    pin,
                    hashes: decision.candidate.hashes.clone(),
                    marker,
                    editable: decision.source.is_editable(),
                    extras: state.extras.get(name).cloned().unwrap_or_default(),
                    requires,
                },
            );
        }
        packages
    }
}

/// Decide a candidate for a name and enqueue its admitted sub-requirements.
fn apply_decision(
    state: &mut State,
    name: &PackageName,
    candidate: Candidate,
    item: &PendingRequirement,
) {
    let active: Vec<ExtraName> = state
        .extras
        .get(name)
        .map(|extras| extras.iter().cloned().collect())
        .unwrap_or_default();
    for sub in &candidate.requires {
        // Extras back-references to the package itself add nothing.
        if sub.name.as_ref() == Some(name) {
            continue;
        }
        if gate(sub, &active) {
            let chain = item.chain.child(chain_link(sub));
            state.enqueue(sub.clone(), chain);
        }
    }
    debug!("Selecting {name}=={}", candidate.version);
    state.decided.insert(
        name.clone(),
        Decision {
            candidate,
            source: item.requirement.source.clone(),
            chain: item.chain.clone(),
            expanded_extras: active.into_iter().collect(),
        },
    );
}

/// Enqueue the sub-requirements newly admitted by extras activated since
/// the decision was expanded.
fn expand_extras(state: &mut State, name: &PackageName) {
    let Some(decision) = state.decided.get(name) else {
        return;
    };
    let active: BTreeSet<ExtraName> = state.extras.get(name).cloned().unwrap_or_default();
    if active == decision.expanded_extras {
        return;
    }
    let before: Vec<ExtraName> = decision.expanded_extras.iter().cloned().collect();
    let after: Vec<ExtraName> = active.iter().cloned().collect();
    let requires = decision.candidate.requires.clone();
    let chain = decision.chain.clone();
    if let Some(decision) = state.decided.get_mut(name) {
        decision.expanded_extras = active;
    }
    for sub in requires {
        if sub.name.as_ref() == Some(name) {
            continue;
        }
        if !gate(&sub, &before) && gate(&sub, &after) {
            let chain = chain.child(chain_link(&sub));
            state.enqueue(sub, chain);
        }
    }
}

/// Whether a sub-requirement applies given the active extras. Environment
/// markers are never evaluated during resolution; only extra guards filter.
fn gate(requirement: &Requirement, active: &[ExtraName]) -> bool {
    requirement
        .marker
        .as_ref()
        .map_or(true, |marker| marker.evaluate_optimistically(active))
}

fn mentions_extra(marker: &MarkerTree) -> bool {
    match marker {
        MarkerTree::Expression(expression) => expression.key == MarkerKey::Extra,
        MarkerTree::And(children) | MarkerTree::Or(children) => {
            children.iter().any(mentions_extra)
        }
    }
}

fn combine_markers(markers: &[MarkerTree]) -> MarkerTree {
    if let [marker] = markers {
        marker.clone()
    } else {
        MarkerTree::Or(markers.to_vec())
    }
}

/// One rendered chain link, e.g. `idna>=2.5,<2.7` or a bare name.
fn chain_link(requirement: &Requirement) -> String {
    match (&requirement.name, requirement.specifiers()) {
        (Some(name), Some(specifiers)) if !specifiers.is_empty() => format!("{name}{specifiers}"),
        (Some(name), _) => name.to_string(),
        (None, _) => requirement.to_string(),
    }
}

/// The constraint text recorded on a requires-edge.
fn constraint_text(requirement: &Requirement) -> String {
    requirement
        .specifiers()
        .map_or_else(|| "*".to_string(), ToString::to_string)
}

fn render_intersection(tracked: &[TrackedConstraint]) -> String {
    let rendered: Vec<String> = tracked
        .iter()
        .filter(|tracked| !tracked.specifiers.is_empty())
        .map(|tracked| tracked.specifiers.to_string())
        .collect();
    if rendered.is_empty() {
        "*".to_string()
    } else {
        rendered.join(",")
    }
}

fn requires_graph(
    partitions: [&BTreeMap<PackageName, LockedPackage>; 2],
) -> DiGraph<PackageName, String> {
    let mut graph = DiGraph::new();
    let mut nodes: BTreeMap<PackageName, NodeIndex> = BTreeMap::new();
    for partition in partitions {
        for name in partition.keys() {
            if !nodes.contains_key(name) {
                let index = graph.add_node(name.clone());
                nodes.insert(name.clone(), index);
            }
        }
    }
    let mut seen = FxHashSet::default();
    for partition in partitions {
        for (name, package) in partition {
            for (target, constraint) in &package.requires {
                let (Some(&from), Some(&to)) = (nodes.get(name), nodes.get(target)) else {
                    continue;
                };
                if seen.insert((from, to)) {
                    graph.add_edge(from, to, constraint.clone());
                }
            }
        }
    }
    graph
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use petrel_spec::MarkerEnvironment;

    use super::*;

    /// An in-memory provider over a fixed package universe.
    #[derive(Default)]
    struct StaticProvider {
        index: FxHashMap<PackageName, Vec<Candidate>>,
        pinned: FxHashMap<String, Candidate>,
        index_calls: AtomicUsize,
        /// Per-name transient failure budgets, consumed before success.
        flaky: Mutex<FxHashMap<PackageName, usize>>,
    }

    impl StaticProvider {
        fn add(&mut self, candidate: Candidate) {
            let versions = self.index.entry(candidate.name.clone()).or_default();
            versions.push(candidate);
            versions.sort_by(|a, b| b.version.cmp(&a.version));
        }

        fn add_pinned(&mut self, key: &str, candidate: Candidate) {
            self.pinned.insert(key.to_string(), candidate);
        }

        fn fail_transiently(&mut self, package: &str, times: usize) {
            self.flaky.lock().unwrap().insert(name(package), times);
        }
    }

    impl MetadataProvider for StaticProvider {
        fn index_candidates<'io>(
            &'io self,
            name: &'io PackageName,
        ) -> impl Future<Output = Result<Vec<Candidate>, ResolveError>> + Send + 'io {
            async move {
                self.index_calls.fetch_add(1, Ordering::SeqCst);
                {
                    let mut flaky = self.flaky.lock().unwrap();
                    if let Some(remaining) = flaky.get_mut(name) {
                        if *remaining > 0 {
                            *remaining -= 1;
                            return Err(ResolveError::SourceUnavailable {
                                location: format!("https://index.invalid/{name}/json"),
                                reason: "connection reset".to_string(),
                            });
                        }
                    }
                }
                Ok(self.index.get(name).cloned().unwrap_or_default())
            }
        }

        fn pinned_candidate<'io>(
            &'io self,
            requirement: &'io Requirement,
        ) -> impl Future<Output = Result<Candidate, ResolveError>> + Send + 'io {
            async move {
                let Some(SourceKey::Pinned(key)) = SourceKey::pinned(&requirement.source) else {
                    return Err(ResolveError::Metadata(
                        requirement.to_string(),
                        "not a pinned source".to_string(),
                    ));
                };
                self.pinned.get(&key).cloned().ok_or_else(|| {
                    ResolveError::SourceUnavailable {
                        location: key,
                        reason: "no such source".to_string(),
                    }
                })
            }
        }
    }

    fn name(value: &str) -> PackageName {
        PackageName::new(value).unwrap()
    }

    fn req(package: &str, constraint: &str) -> Requirement {
        Requirement::registry(
            name(package),
            VersionSpecifiers::from_str(constraint).unwrap(),
        )
    }

    fn guarded(package: &str, constraint: &str, marker: &str) -> Requirement {
        let mut requirement = req(package, constraint);
        requirement.marker = Some(MarkerTree::from_str(marker).unwrap());
        requirement
    }

    fn candidate(package: &str, version: &str, requires: Vec<Requirement>) -> Candidate {
        let mut candidate = Candidate::new(name(package), Version::from_str(version).unwrap());
        candidate.hashes = vec![format!("sha256:{:0>64}", format!("{package}{version}").len())];
        candidate.requires = requires;
        candidate
    }

    fn manifest(content: &str) -> Manifest {
        Manifest::from_str(content).unwrap()
    }

    /// The requests 2.18.4 universe, including an older urllib3 and an
    /// out-of-range idna.
    fn requests_provider() -> StaticProvider {
        let mut provider = StaticProvider::default();
        provider.add(candidate(
            "requests",
            "2.18.4",
            vec![
                req("certifi", ">=2017.4.17"),
                req("chardet", ">=3.0.2,<3.1.0"),
                req("idna", ">=2.5,<2.7"),
                req("urllib3", ">=1.21.1,<1.23"),
            ],
        ));
        provider.add(candidate("certifi", "2018.1.18", vec![]));
        provider.add(candidate("chardet", "3.0.4", vec![]));
        provider.add(candidate("idna", "2.7", vec![]));
        provider.add(candidate("idna", "2.6", vec![]));
        provider.add(candidate("urllib3", "1.23", vec![]));
        provider.add(candidate("urllib3", "1.22", vec![]));
        provider
    }

    #[tokio::test]
    async fn resolves_a_transitive_closure() {
        let provider = requests_provider();
        let manifest = manifest("[packages]\nrequests = \"*\"\n");
        let resolver = Resolver::new(&manifest, ResolverConfig::default(), &provider);

        let resolution = resolver.resolve().await.unwrap();
        let names: Vec<_> = resolution.default.keys().map(ToString::to_string).collect();
        assert_eq!(
            names,
            ["certifi", "chardet", "idna", "requests", "urllib3"]
        );
        assert!(resolution.develop.is_empty());

        let requests = &resolution.default[&name("requests")];
        assert_eq!(requests.pin, Pin::Version(Version::from_str("2.18.4").unwrap()));
        assert_eq!(
            requests.requires.get(&name("idna")).map(String::as_str),
            Some(">=2.5,<2.7")
        );
        // The constraint admits 2.6 but not 2.7.
        let idna = &resolution.default[&name("idna")];
        assert_eq!(idna.pin, Pin::Version(Version::from_str("2.6").unwrap()));

        assert!(resolution
            .default
            .values()
            .all(|package| !package.hashes.is_empty()));
        assert_eq!(resolution.graph.node_count(), 5);
        assert_eq!(resolution.graph.edge_count(), 4);
    }

    #[tokio::test]
    async fn worker_count_does_not_change_the_lockfile() {
        let manifest = manifest("[packages]\nrequests = \"*\"\n");
        let mut lockfiles = Vec::new();
        for workers in [1, 8] {
            let provider = requests_provider();
            let config = ResolverConfig {
                workers,
                ..ResolverConfig::default()
            };
            let resolver = Resolver::new(&manifest, config, &provider);
            let resolution = resolver.resolve().await.unwrap();
            lockfiles.push(resolution.into_lockfile(&manifest).to_string_canonical());
        }
        assert_eq!(lockfiles[0], lockfiles[1]);
    }

    #[tokio::test]
    async fn conflicting_roots_report_both_chains() {
        let mut provider = StaticProvider::default();
        provider.add(candidate("a", "1.0", vec![req("x", "==1.0")]));
        provider.add(candidate("b", "1.0", vec![req("x", "==2.0")]));
        provider.add(candidate("x", "2.0", vec![]));
        provider.add(candidate("x", "1.0", vec![]));
        let manifest = manifest("[packages]\na = \"*\"\nb = \"*\"\n");
        let resolver = Resolver::new(&manifest, ResolverConfig::default(), &provider);

        let err = resolver.resolve().await.unwrap_err();
        let ResolveError::Conflict(conflict) = &err else {
            panic!("expected a conflict, got: {err}");
        };
        assert_eq!(conflict.name, name("x"));
        let report = err.to_string();
        assert!(report.contains("a -> x==1.0"), "{report}");
        assert!(report.contains("b -> x==2.0"), "{report}");
    }

    #[tokio::test]
    async fn backtracks_to_an_older_version() {
        let mut provider = StaticProvider::default();
        provider.add(candidate("a", "1.0", vec![req("x", ">=1")]));
        provider.add(candidate("b", "1.0", vec![req("c", "*")]));
        provider.add(candidate("c", "1.0", vec![req("x", "<2")]));
        provider.add(candidate("x", "2.0", vec![]));
        provider.add(candidate("x", "1.0", vec![]));
        let manifest = manifest("[packages]\na = \"*\"\nb = \"*\"\n");
        let resolver = Resolver::new(&manifest, ResolverConfig::default(), &provider);

        let resolution = resolver.resolve().await.unwrap();
        let x = &resolution.default[&name("x")];
        assert_eq!(x.pin, Pin::Version(Version::from_str("1.0").unwrap()));
        assert_eq!(resolution.default.len(), 4);
    }

    #[tokio::test]
    async fn extras_activate_guarded_requirements() {
        let mut provider = StaticProvider::default();
        provider.add(candidate(
            "x",
            "1.0",
            vec![
                req("idna", "*"),
                guarded("pysocks", ">=1.5.6", "extra == 'socks'"),
            ],
        ));
        provider.add(candidate("idna", "2.6", vec![]));
        provider.add(candidate("pysocks", "1.6.8", vec![]));

        let with_extra = manifest("[packages]\nx = { version = \"*\", extras = [\"socks\"] }\n");
        let resolver = Resolver::new(&with_extra, ResolverConfig::default(), &provider);
        let resolution = resolver.resolve().await.unwrap();
        assert!(resolution.default.contains_key(&name("pysocks")));
        let x = &resolution.default[&name("x")];
        assert!(x.extras.contains(&ExtraName::new("socks").unwrap()));
        assert!(x.requires.contains_key(&name("pysocks")));

        let without_extra = manifest("[packages]\nx = \"*\"\n");
        let provider = {
            let mut provider = StaticProvider::default();
            provider.add(candidate(
                "x",
                "1.0",
                vec![
                    req("idna", "*"),
                    guarded("pysocks", ">=1.5.6", "extra == 'socks'"),
                ],
            ));
            provider.add(candidate("idna", "2.6", vec![]));
            provider.add(candidate("pysocks", "1.6.8", vec![]));
            provider
        };
        let resolver = Resolver::new(&without_extra, ResolverConfig::default(), &provider);
        let resolution = resolver.resolve().await.unwrap();
        assert!(!resolution.default.contains_key(&name("pysocks")));
    }

    #[tokio::test]
    async fn extras_arriving_after_a_decision_expand_it() {
        // `x` is decided without extras via `a`; `c` then requests
        // `x[socks]`, which must admit the guarded requirement after the
        // fact.
        let mut provider = StaticProvider::default();
        provider.add(candidate("a", "1.0", vec![req("x", "*")]));
        provider.add(candidate("b", "1.0", vec![req("c", "*")]));
        let mut with_extra = req("x", "*");
        with_extra.extras.insert(ExtraName::new("socks").unwrap());
        provider.add(candidate("c", "1.0", vec![with_extra]));
        provider.add(candidate(
            "x",
            "1.0",
            vec![guarded("pysocks", "*", "extra == 'socks'")],
        ));
        provider.add(candidate("pysocks", "1.6.8", vec![]));
        let manifest = manifest("[packages]\na = \"*\"\nb = \"*\"\n");
        let resolver = Resolver::new(&manifest, ResolverConfig::default(), &provider);

        let resolution = resolver.resolve().await.unwrap();
        assert!(resolution.default.contains_key(&name("pysocks")));
    }

    #[tokio::test]
    async fn environment_markers_are_locked_not_evaluated() {
        let mut provider = StaticProvider::default();
        provider.add(candidate("colorama", "0.3.9", vec![]));
        let manifest =
            manifest("[packages]\ncolorama = { version = \"*\", markers = \"os_name == 'nt'\" }\n");
        let resolver = Resolver::new(&manifest, ResolverConfig::default(), &provider);

        let resolution = resolver.resolve().await.unwrap();
        let colorama = &resolution.default[&name("colorama")];
        assert!(colorama.marker.is_some());

        let lockfile = resolution.into_lockfile(&manifest);
        let nt = MarkerEnvironment {
            os_name: Some("nt".to_string()),
            ..MarkerEnvironment::default()
        };
        let posix = MarkerEnvironment {
            os_name: Some("posix".to_string()),
            ..MarkerEnvironment::default()
        };
        assert_eq!(lockfile.install_set(Section::Default, &nt).len(), 1);
        assert!(lockfile.install_set(Section::Default, &posix).is_empty());
    }

    #[tokio::test]
    async fn pinned_vcs_requirement_is_a_fixed_point() {
        let mut provider = StaticProvider::default();
        let mut pkg = candidate("pkg", "1.0", vec![req("idna", "*")]);
        pkg.hashes.clear();
        pkg.reference = Some("7ab1c2d".to_string());
        provider.add_pinned("git+https://example.org/pkg.git@main", pkg);
        provider.add(candidate("idna", "2.6", vec![]));
        let manifest =
            manifest("[packages]\npkg = { git = \"https://example.org/pkg.git\", ref = \"main\" }\n");
        let resolver = Resolver::new(&manifest, ResolverConfig::default(), &provider);

        let resolution = resolver.resolve().await.unwrap();
        let pkg = &resolution.default[&name("pkg")];
        assert_eq!(
            pkg.pin,
            Pin::Vcs {
                kind: petrel_spec::VcsKind::Git,
                url: "https://example.org/pkg.git".to_string(),
                reference: Some("7ab1c2d".to_string()),
            }
        );
        assert!(pkg.hashes.is_empty());
        assert!(resolution.default.contains_key(&name("idna")));
    }

    #[tokio::test]
    async fn constraints_never_replace_a_pin() {
        let mut provider = StaticProvider::default();
        let mut pkg = candidate("pkg", "1.0", vec![]);
        pkg.reference = Some("7ab1c2d".to_string());
        provider.add_pinned("git+https://example.org/pkg.git@main", pkg);
        provider.add(candidate("other", "1.0", vec![req("pkg", "==2.0")]));
        let manifest = manifest(
            "[packages]\npkg = { git = \"https://example.org/pkg.git\", ref = \"main\" }\nother = \"*\"\n",
        );
        let resolver = Resolver::new(&manifest, ResolverConfig::default(), &provider);

        let err = resolver.resolve().await.unwrap_err();
        assert!(matches!(err, ResolveError::Conflict(_)), "{err}");
    }

    #[tokio::test]
    async fn pinned_metadata_name_is_authoritative() {
        let mut provider = StaticProvider::default();
        provider.add_pinned(
            "https://example.org/beta-1.0.tar.gz",
            candidate("beta", "1.0", vec![]),
        );
        let manifest =
            manifest("[packages]\nalpha = { file = \"https://example.org/beta-1.0.tar.gz\" }\n");
        let resolver = Resolver::new(&manifest, ResolverConfig::default(), &provider);

        let err = resolver.resolve().await.unwrap_err();
        assert!(matches!(err, ResolveError::NameMismatch { .. }), "{err}");
    }

    #[tokio::test]
    async fn dev_section_resolves_its_own_copy() {
        let provider = requests_provider();
        let manifest = manifest("[packages]\nrequests = \"*\"\n\n[dev-packages]\nrequests = \"*\"\n");
        let resolver = Resolver::new(&manifest, ResolverConfig::default(), &provider);

        let resolution = resolver.resolve().await.unwrap();
        assert_eq!(resolution.default.len(), 5);
        assert_eq!(resolution.develop.len(), 5);
        assert_eq!(
            resolution.default[&name("requests")].pin,
            resolution.develop[&name("requests")].pin
        );
        // The fetch cache is shared across sections, so each name is
        // queried once despite appearing in both closures.
        assert_eq!(provider.index_calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn unknown_package_is_not_found() {
        let provider = StaticProvider::default();
        let manifest = manifest("[packages]\nno-such-package = \"*\"\n");
        let resolver = Resolver::new(&manifest, ResolverConfig::default(), &provider);

        let err = resolver.resolve().await.unwrap_err();
        assert!(matches!(err, ResolveError::NoMatchingCandidate(_)), "{err}");
        assert!(err
            .to_string()
            .contains("Could not find any version of `no-such-package`"));
    }

    #[tokio::test]
    async fn unsatisfiable_constraint_reports_the_chain() {
        let provider = requests_provider();
        let manifest = manifest("[packages]\nrequests = \">=99\"\n");
        let resolver = Resolver::new(&manifest, ResolverConfig::default(), &provider);

        let err = resolver.resolve().await.unwrap_err();
        let report = err.to_string();
        assert!(matches!(err, ResolveError::NoMatchingCandidate(_)), "{err}");
        assert!(report.contains(">=99"), "{report}");
        assert!(report.contains("via: requests>=99"), "{report}");
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let mut provider = requests_provider();
        provider.fail_transiently("requests", 1);
        let manifest = manifest("[packages]\nrequests = \"*\"\n");
        let resolver = Resolver::new(&manifest, ResolverConfig::default(), &provider);

        let resolution = resolver.resolve().await.unwrap();
        assert_eq!(resolution.default.len(), 5);
    }
}
