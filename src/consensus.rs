//! Team quorum voting on prospective assets.
//!
//! Ballots are grouped per (team, asset). A round closes on quorum, on a full
//! team without quorum, or when its window lapses. Teams never pool votes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::EngineConfig;
use crate::error::{EngineError, RegistrationRejection, ValidationError};
use crate::logging::{self, Domain};
use crate::metrics::EngineStats;
use crate::types::{ConsensusBallot, ConsensusDecision, DecisionOutcome, RejectionReason, Timestamp};

/// Implemented by whatever owns asset capacity.
pub trait AssetRegistrar: Send + Sync {
    fn register(&self, asset: &str, now: Timestamp) -> Result<(), RegistrationRejection>;
}

type ProposalKey = (String, String);

#[derive(Debug)]
struct Proposal {
    opened_at: Timestamp,
    ballots: Vec<ConsensusBallot>,
}

#[derive(Debug, Default)]
struct Book {
    open: HashMap<ProposalKey, Proposal>,
    /// Decided rounds, kept until their window ends so stragglers are refused.
    closed: HashMap<ProposalKey, Timestamp>,
}

enum Verdict {
    Approve,
    Reject(RejectionReason),
}

pub struct ConsensusEngine {
    team_size: usize,
    quorum: usize,
    approval_confidence: f64,
    window_ms: u64,
    book: Mutex<Book>,
    registrar: Arc<dyn AssetRegistrar>,
    stats: Arc<EngineStats>,
    shutting_down: AtomicBool,
}

impl ConsensusEngine {
    pub fn new(cfg: &EngineConfig, registrar: Arc<dyn AssetRegistrar>, stats: Arc<EngineStats>) -> Self {
        Self {
            team_size: cfg.team_size,
            quorum: cfg.quorum,
            approval_confidence: cfg.approval_confidence,
            window_ms: cfg.proposal_window_ms,
            book: Mutex::new(Book::default()),
            registrar,
            stats,
            shutting_down: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Record a ballot. Returns every decision it caused: possibly a lapse of
    /// the previous round, and the verdict of the current one.
    pub fn cast(&self, ballot: ConsensusBallot, now: Timestamp) -> Result<Vec<ConsensusDecision>, EngineError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            EngineStats::incr(&self.stats.ballots_invalid);
            logging::log_rejected(Domain::Consensus, "ballot", "shutting_down");
            return Err(EngineError::ShuttingDown);
        }
        if let Err(e) = ballot.validate() {
            return Err(self.invalid(e));
        }

        let key = (ballot.team_id.clone(), ballot.proposed_asset.clone());
        let mut decisions = Vec::new();
        let ready = {
            let mut book = self.lock();
            book.closed.retain(|_, until| *until > now);
            if book.closed.contains_key(&key) {
                drop(book);
                return Err(self.invalid(ValidationError::ProposalClosed {
                    team_id: key.0,
                    asset: key.1,
                }));
            }
            let lapsed = book
                .open
                .get(&key)
                .is_some_and(|p| p.opened_at.saturating_add(self.window_ms) <= now);
            if lapsed {
                if let Some(p) = book.open.remove(&key) {
                    decisions.push(self.reject(&key, &p, RejectionReason::WindowLapsed, now));
                }
            }

            let proposal = book.open.entry(key.clone()).or_insert_with(|| Proposal {
                opened_at: now,
                ballots: Vec::with_capacity(self.team_size),
            });
            match proposal.ballots.iter().position(|b| b.voter_id == ballot.voter_id) {
                Some(i) => proposal.ballots[i] = ballot,
                // A full team always reaches a verdict, so the round is closed by now.
                None => proposal.ballots.push(ballot),
            }
            EngineStats::incr(&self.stats.ballots_accepted);

            let verdict = self.tally(proposal);
            match verdict {
                Some(v) => {
                    let closes_at = proposal.opened_at.saturating_add(self.window_ms);
                    let p = book.open.remove(&key);
                    book.closed.insert(key.clone(), closes_at);
                    p.map(|p| (p, v))
                }
                None => None,
            }
        };

        // Registration takes the lifecycle lock; never hold ours across it.
        if let Some((proposal, verdict)) = ready {
            let decision = match verdict {
                Verdict::Reject(reason) => self.reject(&key, &proposal, reason, now),
                Verdict::Approve => match self.registrar.register(&key.1, now) {
                    Ok(()) => {
                        EngineStats::incr(&self.stats.approvals);
                        self.decide(&key, &proposal, DecisionOutcome::Approved, now)
                    }
                    Err(RegistrationRejection::CapacityExhausted) => {
                        self.reject(&key, &proposal, RejectionReason::CapacityExhausted, now)
                    }
                    Err(RegistrationRejection::AlreadyLive) => {
                        self.reject(&key, &proposal, RejectionReason::AlreadyLive, now)
                    }
                },
            };
            decisions.push(decision);
        }
        Ok(decisions)
    }

    /// Close every round whose window has lapsed.
    pub fn sweep(&self, now: Timestamp) -> Vec<ConsensusDecision> {
        let lapsed: Vec<(ProposalKey, Proposal)> = {
            let mut book = self.lock();
            book.closed.retain(|_, until| *until > now);
            let keys: Vec<ProposalKey> = book
                .open
                .iter()
                .filter(|(_, p)| p.opened_at.saturating_add(self.window_ms) <= now)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| book.open.remove(&k).map(|p| (k, p)))
                .collect()
        };
        lapsed
            .iter()
            .map(|(k, p)| self.reject(k, p, RejectionReason::WindowLapsed, now))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().open.len()
    }

    fn approvals(&self, proposal: &Proposal) -> usize {
        proposal
            .ballots
            .iter()
            .filter(|b| b.confidence > self.approval_confidence)
            .count()
    }

    fn tally(&self, proposal: &Proposal) -> Option<Verdict> {
        if self.approvals(proposal) >= self.quorum {
            Some(Verdict::Approve)
        } else if proposal.ballots.len() >= self.team_size {
            Some(Verdict::Reject(RejectionReason::NoQuorum))
        } else {
            None
        }
    }

    fn invalid(&self, e: ValidationError) -> EngineError {
        EngineStats::incr(&self.stats.ballots_invalid);
        logging::log_rejected(Domain::Consensus, "ballot", &e.to_string());
        EngineError::Validation(e)
    }

    fn reject(&self, key: &ProposalKey, proposal: &Proposal, reason: RejectionReason, now: Timestamp) -> ConsensusDecision {
        let counter = match reason {
            RejectionReason::NoQuorum => &self.stats.rejections_no_quorum,
            RejectionReason::WindowLapsed => &self.stats.rejections_window_lapsed,
            RejectionReason::CapacityExhausted => &self.stats.rejections_capacity,
            RejectionReason::AlreadyLive => &self.stats.rejections_already_live,
        };
        EngineStats::incr(counter);
        self.decide(key, proposal, DecisionOutcome::Rejected(reason), now)
    }

    fn decide(&self, key: &ProposalKey, proposal: &Proposal, outcome: DecisionOutcome, now: Timestamp) -> ConsensusDecision {
        let approvals = self.approvals(proposal);
        let (label, reason) = match outcome {
            DecisionOutcome::Approved => ("approved", ""),
            DecisionOutcome::Rejected(r) => ("rejected", r.as_str()),
        };
        logging::log_decision(&key.0, &key.1, label, reason, approvals);
        ConsensusDecision {
            team_id: key.0.clone(),
            asset: key.1.clone(),
            outcome,
            approvals,
            ballots: proposal.ballots.len(),
            decided_at: now,
        }
    }
}
