//! Transaction admission, ordering and batching.
//!
//! The service owns the Ready and Future queues, a batch timer and one query
//! group. Admission (`add`) validates a submission through the wallet
//! service, routes it to Ready, Future or the replacement path, and promotes
//! Future records when a nonce gap closes. Batch execution (`run_batch`)
//! selects the highest-priority Ready records, pay-checks them against
//! reward-token balances and submits them as one settlement batch.
//!
//! Both entry points run their whole body inside the query group, including
//! the remote validation call. That bounds admission throughput on purpose:
//! one lock means overlapping admissions cannot race, and no finer-grained
//! locking is needed anywhere.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use crate::config::AggregatorConfig;
use crate::db::{Database, QueueTable, FUTURE_TABLE, READY_TABLE};
use crate::txs::batch_timer::{BatchTimer, FlushFn};
use crate::txs::query_group::QueryGroup;
use crate::txs::types::{TxFailure, TxRecord, TxServiceError, TxSubmission};
use crate::wallet::{WalletError, WalletService};

/// Counters exposed for operators and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxServiceStats {
    pub ready: u64,
    pub future: u64,
    pub completed_batches: u64,
}

struct AddOutcome {
    failures: Vec<TxFailure>,
    ready_count: u64,
}

pub struct TxService {
    config: AggregatorConfig,
    wallet: Arc<dyn WalletService>,
    ready: QueueTable,
    future: QueueTable,
    query_group: QueryGroup,
    batch_timer: Arc<BatchTimer>,
}

impl TxService {
    pub fn new(
        config: AggregatorConfig,
        db: Arc<Database>,
        wallet: Arc<dyn WalletService>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<TxService>| {
            let flush_weak = weak.clone();
            let flush: FlushFn = Arc::new(move || {
                let weak = flush_weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(service) => service.run_batch().await,
                        None => Ok(()),
                    }
                })
            });
            let batch_timer = BatchTimer::new(config.max_batch_delay, flush);

            Self {
                ready: QueueTable::new(db.clone(), READY_TABLE),
                future: QueueTable::new(db.clone(), FUTURE_TABLE),
                query_group: QueryGroup::new("tx-service", db),
                batch_timer,
                config,
                wallet,
            }
        })
    }

    /// The timer driving debounced flushes. Exposed so callers can await
    /// batch completion.
    pub fn batch_timer(&self) -> &Arc<BatchTimer> {
        &self.batch_timer
    }

    /// Admit a submission. Returns the (possibly empty) list of client-facing
    /// rejections; infrastructure faults propagate as errors.
    pub async fn add(&self, tx: TxSubmission) -> Result<Vec<TxFailure>, TxServiceError> {
        log::info!(
            "[TxService] add: sender={} nonce={} reward={}",
            tx.sender,
            tx.nonce,
            tx.reward
        );
        let outcome = self.query_group.run(|| self.add_inner(&tx)).await?;
        // The timer is only touched after the group committed; a synchronous
        // trigger re-enters the (now free) query group for the batch.
        self.reevaluate_batch_timer(outcome.ready_count).await?;
        Ok(outcome.failures)
    }

    async fn add_inner(&self, tx: &TxSubmission) -> Result<AddOutcome, TxServiceError> {
        let check = match self.wallet.check_tx(tx).await {
            Ok(outcome) => outcome,
            Err(WalletError::CannotEstimateGas(reason)) => {
                log::warn!(
                    "[TxService] gas estimation failed for sender={} nonce={}: {}",
                    tx.sender,
                    tx.nonce,
                    reason
                );
                return Ok(AddOutcome {
                    failures: vec![TxFailure::unpredictable_gas_limit(reason)],
                    ready_count: self.ready.count()?,
                });
            }
            Err(e) => return Err(e.into()),
        };
        if !check.failures.is_empty() {
            return Ok(AddOutcome {
                failures: check.failures,
                ready_count: self.ready.count()?,
            });
        }

        let highest_ready_nonce = match self.ready.next_nonce_of(&tx.sender)? {
            Some(next) => next.max(check.next_nonce),
            None => check.next_nonce,
        };

        let failures = if tx.nonce < highest_ready_nonce {
            // The slot is already represented (or stale); only a strictly
            // better offer may take it.
            self.replace_ready_tx(tx)?
        } else if tx.nonce == highest_ready_nonce {
            self.ready.add(tx)?;
            self.try_move_future_txs(&tx.sender, highest_ready_nonce + 1)?;
            Vec::new()
        } else {
            self.ensure_future_tx_space()?;
            self.future.add(tx)?;
            log::debug!(
                "[TxService] parked sender={} nonce={} behind gap (frontier {})",
                tx.sender,
                tx.nonce,
                highest_ready_nonce
            );
            Vec::new()
        };

        Ok(AddOutcome {
            failures,
            ready_count: self.ready.count()?,
        })
    }

    /// Replace the Ready record at the submission's slot if the new offer is
    /// strictly better. Ready records after the replaced slot are reinserted
    /// so their priority ids land after the replacement: a record must never
    /// out-prioritize a record its execution still depends on.
    fn replace_ready_tx(&self, new_tx: &TxSubmission) -> Result<Vec<TxFailure>, TxServiceError> {
        let Some(existing) = self.ready.find(&new_tx.sender, new_tx.nonce)? else {
            // Consumed by a batch between validation and now.
            return Ok(vec![TxFailure::duplicate_nonce(new_tx.nonce)]);
        };
        if new_tx.reward <= existing.reward {
            return Ok(vec![TxFailure::insufficient_reward(existing.reward)]);
        }

        log::info!(
            "[TxService] replacing ready tx sender={} nonce={}: reward {} -> {}",
            new_tx.sender,
            new_tx.nonce,
            existing.reward,
            new_tx.reward
        );
        self.ready.remove(&existing)?;
        self.ready.add(new_tx)?;

        let mut after = Some(new_tx.nonce);
        loop {
            let successors =
                self.ready
                    .find_after(&new_tx.sender, after, self.config.page_limit)?;
            let Some(last) = successors.last() else {
                break;
            };
            after = Some(last.nonce);
            let full_page = successors.len() == self.config.page_limit;
            for rec in &successors {
                self.ready.remove(rec)?;
                self.ready.readd(rec)?;
            }
            if !full_page {
                break;
            }
        }

        Ok(Vec::new())
    }

    /// Promote Future records for `sender` that became contiguous now that
    /// `highest_ready_nonce` is the first open slot. Competing offers for the
    /// same nonce resolve to the highest reward; promotions stop at the first
    /// remaining gap. Replacement never re-attempts further promotions.
    fn try_move_future_txs(
        &self,
        sender: &str,
        mut highest_ready_nonce: u64,
    ) -> Result<(), TxServiceError> {
        loop {
            let page = self.future.find_after(sender, None, self.config.page_limit)?;
            if page.is_empty() {
                break;
            }
            let full_page = page.len() == self.config.page_limit;

            // Best candidate per nonce; the page is ordered by nonce.
            let mut candidates: Vec<&TxRecord> = Vec::new();
            for rec in &page {
                match candidates.last_mut() {
                    Some(best) if best.nonce == rec.nonce => {
                        if rec.reward > best.reward {
                            *best = rec;
                        }
                    }
                    _ => candidates.push(rec),
                }
            }

            let mut promoted: Vec<&TxRecord> = Vec::new();
            let mut reached_gap = false;
            for cand in candidates {
                if cand.nonce < highest_ready_nonce {
                    // A parked offer may still outbid the ready record at an
                    // already-covered slot.
                    let failures = self.replace_ready_tx(&cand.to_submission())?;
                    if let Some(failure) = failures.first() {
                        log::debug!(
                            "[TxService] parked offer sender={} nonce={} lost: {}",
                            sender,
                            cand.nonce,
                            failure
                        );
                    }
                } else if cand.nonce == highest_ready_nonce {
                    promoted.push(cand);
                    highest_ready_nonce += 1;
                } else {
                    reached_gap = true;
                    break;
                }
            }

            if !promoted.is_empty() {
                log::info!(
                    "[TxService] promoting {} future txs for sender={} up to nonce {}",
                    promoted.len(),
                    sender,
                    highest_ready_nonce - 1
                );
            }
            for rec in promoted {
                self.ready.readd(rec)?;
            }

            // Everything below the new frontier has been resolved, including
            // losing duplicate offers.
            let mut removed_any = false;
            for rec in &page {
                if rec.nonce < highest_ready_nonce {
                    self.future.remove(rec)?;
                    removed_any = true;
                }
            }

            if reached_gap || !removed_any || !full_page {
                break;
            }
        }
        Ok(())
    }

    /// Make room for one more Future record by evicting the oldest entries
    /// (lowest insertion id first) when the hard bound is reached.
    fn ensure_future_tx_space(&self) -> Result<(), TxServiceError> {
        let count = self.future.count()?;
        if count < self.config.max_future_txs as u64 {
            return Ok(());
        }

        let surplus = (count - self.config.max_future_txs as u64 + 1) as usize;
        let oldest = self.future.highest_priority(surplus)?;
        let Some(frontier) = oldest.last() else {
            log::warn!(
                "[TxService] future table reported {} entries but the eviction scan found none",
                count
            );
            return Ok(());
        };
        let evicted = self.future.clear_before_id(frontier.id + 1)?;
        log::info!(
            "[TxService] evicted {} oldest future txs to admit a new one",
            evicted
        );
        Ok(())
    }

    /// Execute one batch of Ready records. Timer-fired and manual triggers
    /// both land here; the query group serializes them.
    pub async fn run_batch(&self) -> Result<(), TxServiceError> {
        let ready_count = self.query_group.run(|| self.run_batch_inner()).await?;
        self.reevaluate_batch_timer(ready_count).await
    }

    async fn run_batch_inner(&self) -> Result<u64, TxServiceError> {
        let page = self.ready.highest_priority(self.config.page_limit)?;
        if page.is_empty() {
            log::debug!("[TxService] run_batch: nothing ready");
            return Ok(0);
        }

        // One balance lookup per distinct sender in this pass.
        let mut balances: HashMap<String, u128> = HashMap::new();
        for rec in &page {
            if balances.contains_key(&rec.sender) {
                continue;
            }
            let balance = match self.wallet.wallet_address_of(&rec.sender).await? {
                Some(address) => self.wallet.get_reward_balance_of(&address).await?,
                None => {
                    log::warn!("[TxService] no wallet address for sender={}", rec.sender);
                    0
                }
            };
            balances.insert(rec.sender.clone(), balance);
        }

        let mut gapped: HashSet<String> = HashSet::new();
        let mut included: Vec<TxRecord> = Vec::new();
        let mut casualties: Vec<TxRecord> = Vec::new();
        for rec in page {
            if gapped.contains(&rec.sender) {
                // A skipped slot earlier in this pass; nonce order forbids
                // executing anything after it.
                continue;
            }
            let Some(balance) = balances.get_mut(&rec.sender) else {
                continue;
            };
            if *balance >= rec.reward {
                *balance -= rec.reward;
                included.push(rec);
            } else {
                log::info!(
                    "[TxService] sender={} cannot pay reward {} at nonce {}, gapping sender",
                    rec.sender,
                    rec.reward,
                    rec.nonce
                );
                gapped.insert(rec.sender.clone());
                casualties.push(rec);
            }
        }

        if !included.is_empty() {
            log::info!("[TxService] executing batch of {} txs", included.len());
            self.wallet.send_txs(&included).await?;
        }

        // Drop executed records and unpayable casualties, then repair
        // per-sender contiguity.
        let mut touched: Vec<TxRecord> = Vec::new();
        for rec in included.iter().chain(casualties.iter()) {
            self.ready.remove(rec)?;
            if !touched.iter().any(|t| t.sender == rec.sender) {
                touched.push(rec.clone());
            }
        }
        for example in &touched {
            self.demote_no_longer_ready_txs(example).await?;
        }

        Ok(self.ready.count()?)
    }

    /// Re-derive the sender's authoritative next nonce and move every Ready
    /// record that no longer extends the contiguous run back to Future.
    async fn demote_no_longer_ready_txs(&self, example: &TxRecord) -> Result<(), TxServiceError> {
        let next_chain_nonce = match self.wallet.check_tx(&example.to_submission()).await {
            Ok(outcome) => outcome.next_nonce,
            Err(WalletError::CannotEstimateGas(reason)) => {
                log::warn!(
                    "[TxService] skipping demotion for sender={}: {}",
                    example.sender,
                    reason
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mut expected = next_chain_nonce;
        let mut after = next_chain_nonce.checked_sub(1);
        loop {
            let page = self
                .ready
                .find_after(&example.sender, after, self.config.page_limit)?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.nonce);
            let full_page = page.len() == self.config.page_limit;

            for rec in &page {
                if rec.nonce == expected {
                    expected += 1;
                } else {
                    log::info!(
                        "[TxService] demoting sender={} nonce={} back to future",
                        rec.sender,
                        rec.nonce
                    );
                    self.ready.remove(rec)?;
                    self.future.readd(rec)?;
                }
            }
            if !full_page {
                break;
            }
        }
        Ok(())
    }

    /// Arm, trigger or clear the batch timer from the current Ready size.
    /// Must be called outside the query group.
    async fn reevaluate_batch_timer(&self, ready_count: u64) -> Result<(), TxServiceError> {
        if ready_count == 0 {
            self.batch_timer.clear();
        } else if ready_count >= self.config.max_batch_size as u64 {
            self.batch_timer.trigger().await?;
        } else {
            self.batch_timer.notify_tx_waiting();
        }
        Ok(())
    }

    pub async fn stats(&self) -> Result<TxServiceStats, TxServiceError> {
        self.query_group
            .run(|| async {
                Ok(TxServiceStats {
                    ready: self.ready.count()?,
                    future: self.future.count()?,
                    completed_batches: self.batch_timer.completed_batches(),
                })
            })
            .await
    }
}
