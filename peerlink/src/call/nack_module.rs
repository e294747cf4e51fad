//! Missing-sequence tracking and retransmit-request scheduling.
//!
//! `NackModuleImpl` holds the pure state machine; `NackModule` wraps it
//! with the periodic update task and the outbound sinks.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use log::debug;

use shared::numerics::seq_num::{ahead_of, forward_diff};
use shared::units::TimeDelta;
use shared::{Clock, RepeatingTaskHandle, TaskQueue};

/// Sends the NACK feedback message.
pub trait NackSender: Send {
    fn send_nack(&mut self, sequence_numbers: Vec<u16>, buffering_allowed: bool);
}

/// Requests a fresh keyframe when recovery is hopeless.
pub trait KeyFrameRequestSender: Send {
    fn request_keyframe(&mut self);
}

#[derive(Debug, Clone, Copy)]
pub struct NackModuleConfig {
    /// Delay before a freshly missing packet may be NACKed.
    pub send_nack_delay: TimeDelta,
    /// Periodic update interval.
    pub update_interval: TimeDelta,
    /// Retransmit attempts per sequence number before giving up.
    pub max_nack_retries: usize,
    /// Upper bound on tracked missing packets.
    pub max_nack_packets: usize,
    /// Entries older than this many sequence numbers are aged out.
    pub max_packet_age: u16,
}

impl Default for NackModuleConfig {
    fn default() -> Self {
        NackModuleConfig {
            send_nack_delay: TimeDelta::ZERO,
            update_interval: TimeDelta::from_millis(20),
            max_nack_retries: 10,
            max_nack_packets: 1000,
            max_packet_age: 10_000,
        }
    }
}

const DEFAULT_RTT: TimeDelta = TimeDelta::from_millis(100);

#[derive(Debug, Clone, Copy)]
struct NackInfo {
    created_at: shared::units::Timestamp,
    sent_at: Option<shared::units::Timestamp>,
    retries: usize,
}

/// Result of inserting one received packet.
#[derive(Debug, Default, Clone)]
pub struct InsertResult {
    /// NACKs already sent for this sequence number.
    pub nacks_sent_for_packet: usize,
    /// The list overflowed and was cleared: request a keyframe.
    pub keyframe_requested: bool,
    /// New sequence numbers to NACK right away.
    pub nack_list_to_send: Vec<u16>,
}

enum NackFilter {
    /// Entries never sent (subject to the send delay).
    SeqNum,
    /// Entries whose last send is at least one RTT old.
    Time,
}

/// The pure NACK state machine. Not thread safe.
pub struct NackModuleImpl {
    clock: Arc<dyn Clock>,
    config: NackModuleConfig,

    initialized: bool,
    rtt: TimeDelta,
    newest_seq_num: u16,

    keyframe_list: BTreeSet<u16>,
    recovered_list: BTreeSet<u16>,
    nack_list: BTreeMap<u16, NackInfo>,
}

impl NackModuleImpl {
    pub fn new(clock: Arc<dyn Clock>, config: NackModuleConfig) -> Self {
        NackModuleImpl {
            clock,
            config,
            initialized: false,
            rtt: DEFAULT_RTT,
            newest_seq_num: 0,
            keyframe_list: BTreeSet::new(),
            recovered_list: BTreeSet::new(),
            nack_list: BTreeMap::new(),
        }
    }

    pub fn update_rtt(&mut self, rtt: TimeDelta) {
        self.rtt = rtt;
    }

    pub fn nack_list_size(&self) -> usize {
        self.nack_list.len()
    }

    /// Registers a received packet and returns what should be sent now.
    pub fn insert_packet(&mut self, seq_num: u16, is_keyframe: bool, is_recovered: bool) -> InsertResult {
        let mut result = InsertResult::default();
        if !self.initialized {
            self.newest_seq_num = seq_num;
            if is_keyframe {
                self.keyframe_list.insert(seq_num);
            }
            self.initialized = true;
            return result;
        }

        if seq_num == self.newest_seq_num {
            return result;
        }

        if ahead_of(self.newest_seq_num, seq_num) {
            // An older packet arrived: it is no longer missing.
            if let Some(info) = self.nack_list.remove(&seq_num) {
                result.nacks_sent_for_packet = info.retries;
            }
            return result;
        }

        // A newer packet.
        if is_keyframe {
            self.keyframe_list.insert(seq_num);
        }
        let age_limit = seq_num.wrapping_sub(self.config.max_packet_age);
        retain_newer(&mut self.keyframe_list, age_limit);
        retain_newer(&mut self.recovered_list, age_limit);

        if is_recovered {
            self.recovered_list.insert(seq_num);
            // Recovered packets do not move the missing window.
            return result;
        }

        let first_missing = self.newest_seq_num.wrapping_add(1);
        if !self.add_packets_to_nack(first_missing, seq_num) {
            result.keyframe_requested = true;
        }
        self.newest_seq_num = seq_num;

        result.nack_list_to_send = self.nack_batch(NackFilter::SeqNum);
        result
    }

    /// Removes list entries at or before `seq_num`.
    pub fn clear_up_to(&mut self, seq_num: u16) {
        self.nack_list
            .retain(|seq, _| ahead_of(*seq, seq_num));
        self.keyframe_list.retain(|seq| ahead_of(*seq, seq_num));
        self.recovered_list.retain(|seq| ahead_of(*seq, seq_num));
    }

    /// Periodic tick: sequence numbers due for (re-)sending.
    pub fn periodic_update(&mut self) -> Vec<u16> {
        self.nack_batch(NackFilter::Time)
    }

    fn add_packets_to_nack(&mut self, seq_num_start: u16, seq_num_end: u16) -> bool {
        let age_limit = seq_num_end.wrapping_sub(self.config.max_packet_age);
        self.nack_list.retain(|seq, _| !ahead_of(age_limit, *seq));

        let num_new = forward_diff(seq_num_start, seq_num_end) as usize;
        if self.nack_list.len() + num_new > self.config.max_nack_packets {
            while self.remove_packets_until_keyframe() {
                if self.nack_list.len() + num_new <= self.config.max_nack_packets {
                    break;
                }
            }
            if self.nack_list.len() + num_new > self.config.max_nack_packets {
                self.nack_list.clear();
                debug!("nack list overflow, clearing and requesting keyframe");
                return false;
            }
        }

        let now = self.clock.now();
        let mut seq = seq_num_start;
        while seq != seq_num_end {
            if !self.recovered_list.contains(&seq) {
                self.nack_list.insert(
                    seq,
                    NackInfo {
                        created_at: now,
                        sent_at: None,
                        retries: 0,
                    },
                );
            }
            seq = seq.wrapping_add(1);
        }
        true
    }

    /// Drops everything older than the oldest tracked keyframe. Returns
    /// whether anything changed.
    fn remove_packets_until_keyframe(&mut self) -> bool {
        while let Some(&keyframe_seq) = self.keyframe_list.iter().next() {
            let before = self.nack_list.len();
            // Drop everything older than the keyframe.
            self.nack_list.retain(|seq, _| !ahead_of(keyframe_seq, *seq));
            let changed = self.nack_list.len() < before;
            if changed {
                return true;
            }
            // This keyframe bought nothing: try the next.
            self.keyframe_list.remove(&keyframe_seq);
        }
        false
    }

    fn nack_batch(&mut self, filter: NackFilter) -> Vec<u16> {
        let now = self.clock.now();
        let mut batch = Vec::new();
        let mut to_remove = Vec::new();

        for (&seq, info) in self.nack_list.iter_mut() {
            match filter {
                NackFilter::SeqNum => {
                    if info.sent_at.is_none()
                        && now - info.created_at >= self.config.send_nack_delay
                    {
                        info.sent_at = Some(now);
                        info.retries += 1;
                        batch.push(seq);
                    }
                }
                NackFilter::Time => {
                    let due = match info.sent_at {
                        Some(sent_at) => now - sent_at >= self.rtt,
                        None => now - info.created_at >= self.config.send_nack_delay,
                    };
                    if due {
                        if info.retries >= self.config.max_nack_retries {
                            to_remove.push(seq);
                            continue;
                        }
                        info.sent_at = Some(now);
                        info.retries += 1;
                        batch.push(seq);
                    }
                }
            }
        }
        for seq in to_remove {
            debug!("giving up nacking {seq} after retry cap");
            self.nack_list.remove(&seq);
        }
        batch.sort_unstable();
        batch
    }
}

/// Cleans a seq-ordered set of entries older than `age_limit`.
fn retain_newer(set: &mut BTreeSet<u16>, age_limit: u16) {
    set.retain(|seq| !ahead_of(age_limit, *seq));
}

/// Queue-confined wrapper running the periodic update and fanning results
/// out to the sinks.
pub struct NackModule {
    impl_: Arc<Mutex<NackModuleImpl>>,
    nack_sender: Arc<Mutex<dyn NackSender>>,
    keyframe_sender: Arc<Mutex<dyn KeyFrameRequestSender>>,
    _periodic_task: RepeatingTaskHandle,
}

impl NackModule {
    pub fn new(
        clock: Arc<dyn Clock>,
        queue: TaskQueue,
        config: NackModuleConfig,
        nack_sender: Arc<Mutex<dyn NackSender>>,
        keyframe_sender: Arc<Mutex<dyn KeyFrameRequestSender>>,
    ) -> NackModule {
        let impl_ = Arc::new(Mutex::new(NackModuleImpl::new(clock, config)));

        let tick_impl = Arc::clone(&impl_);
        let tick_sender = Arc::clone(&nack_sender);
        let interval = config.update_interval;
        let periodic_task = RepeatingTaskHandle::start(queue, interval, move || {
            let batch = tick_impl.lock().unwrap().periodic_update();
            if !batch.is_empty() {
                tick_sender.lock().unwrap().send_nack(batch, false);
            }
            interval
        });

        NackModule {
            impl_,
            nack_sender,
            keyframe_sender,
            _periodic_task: periodic_task,
        }
    }

    /// Feeds one received packet; immediately emits NACKs for fresh gaps.
    pub fn insert_packet(&self, seq_num: u16, is_keyframe: bool, is_recovered: bool) -> usize {
        let result = self
            .impl_
            .lock()
            .unwrap()
            .insert_packet(seq_num, is_keyframe, is_recovered);
        if !result.nack_list_to_send.is_empty() {
            self.nack_sender
                .lock()
                .unwrap()
                .send_nack(result.nack_list_to_send, true);
        }
        if result.keyframe_requested {
            self.keyframe_sender.lock().unwrap().request_keyframe();
        }
        result.nacks_sent_for_packet
    }

    pub fn clear_up_to(&self, seq_num: u16) {
        self.impl_.lock().unwrap().clear_up_to(seq_num);
    }

    pub fn update_rtt(&self, rtt: TimeDelta) {
        self.impl_.lock().unwrap().update_rtt(rtt);
    }
}
