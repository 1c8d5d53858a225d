use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::otp::{ExactMatchVerifier, OtpGenerator, OtpVerifier, RandomOtpGenerator};
use super::{Ride, RideRequest, RideState, RideTimestamps, TransitionOutcome};
use crate::clock::{Clock, DeadlineQueue};
use crate::error::{DispatchError, DispatchResult};
use crate::events::{OutboundEvent, ReassignReason};
use crate::ledger::EarningsLedger;
use crate::model::{Actor, DriverId, PartitionKey, RideId, Timestamp};
use crate::pricing::{FareEngine, PricingPolicy, SurgeTable};
use crate::queue::QueueManager;
use crate::telemetry::DispatchTelemetry;

const DEFAULT_ACCEPTANCE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_OTP_DIGITS: u8 = 4;
const FINISHED_RIDE_CAPACITY: usize = 4_096;

enum Slot {
    Active(Arc<Mutex<Ride>>),
    Finished(Ride),
}

/// Owns every active ride and drives it through its state machine.
///
/// Each ride sits behind its own mutex, so transitions on one ride are
/// serialized while different rides proceed in parallel. Locks are always
/// taken ride first, then queue partition or driver ledger.
pub struct RideLifecycle {
    clock: Arc<dyn Clock>,
    queue: Arc<QueueManager>,
    ledger: Arc<EarningsLedger>,
    surge: Arc<SurgeTable>,
    telemetry: Arc<DispatchTelemetry>,
    fares: FareEngine,
    policy: PricingPolicy,
    otp_generator: Box<dyn OtpGenerator>,
    otp_verifier: Box<dyn OtpVerifier>,
    acceptance_timeout_ms: u64,
    active: DashMap<RideId, Arc<Mutex<Ride>>>,
    /// Driver to the non-terminal ride they are bound to.
    bound: DashMap<DriverId, RideId>,
    /// Recently finished rides, kept so late or repeated events get a
    /// meaningful answer instead of "not found".
    finished: Mutex<LruCache<RideId, Ride>>,
    deadlines: DeadlineQueue,
    next_ride: AtomicU64,
}

impl RideLifecycle {
    pub fn new(
        clock: Arc<dyn Clock>,
        queue: Arc<QueueManager>,
        ledger: Arc<EarningsLedger>,
        surge: Arc<SurgeTable>,
        telemetry: Arc<DispatchTelemetry>,
    ) -> Self {
        let capacity = NonZeroUsize::new(FINISHED_RIDE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            clock,
            queue,
            ledger,
            surge,
            telemetry,
            fares: FareEngine::default(),
            policy: PricingPolicy::default(),
            otp_generator: Box::new(RandomOtpGenerator::new(DEFAULT_OTP_DIGITS)),
            otp_verifier: Box::new(ExactMatchVerifier),
            acceptance_timeout_ms: DEFAULT_ACCEPTANCE_TIMEOUT_MS,
            active: DashMap::new(),
            bound: DashMap::new(),
            finished: Mutex::new(LruCache::new(capacity)),
            deadlines: DeadlineQueue::default(),
            next_ride: AtomicU64::new(0),
        }
    }

    pub fn with_fares(mut self, fares: FareEngine, policy: PricingPolicy) -> Self {
        self.fares = fares;
        self.policy = policy;
        self
    }

    pub fn with_otp_generator(mut self, generator: Box<dyn OtpGenerator>) -> Self {
        self.otp_generator = generator;
        self
    }

    pub fn with_otp_verifier(mut self, verifier: Box<dyn OtpVerifier>) -> Self {
        self.otp_verifier = verifier;
        self
    }

    pub fn with_acceptance_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.acceptance_timeout_ms = timeout_ms;
        self
    }

    pub fn acceptance_timeout_ms(&self) -> u64 {
        self.acceptance_timeout_ms
    }

    pub fn create(&self, request: RideRequest) -> Ride {
        let sequence = self.next_ride.fetch_add(1, Ordering::SeqCst) + 1;
        let ride = Ride {
            ride_id: RideId::new(format!("ride-{sequence:06}")),
            customer_id: request.customer_id,
            pickup_location_id: request.pickup_location_id,
            drop_location: request.drop_location,
            vehicle_type: request.vehicle_type,
            state: RideState::Requested,
            driver_id: None,
            distance_km: request.distance_km,
            estimated_fare: request.estimated_fare,
            start_otp: None,
            end_otp: None,
            fare: None,
            acceptance_deadline: None,
            skip_driver: None,
            cancel_reason: None,
            released_driver: None,
            timestamps: RideTimestamps {
                requested_at: self.clock.now_ms(),
                ..RideTimestamps::default()
            },
        };
        self.active
            .insert(ride.ride_id.clone(), Arc::new(Mutex::new(ride.clone())));
        self.telemetry.ride_requested();
        info!(
            ride_id = %ride.ride_id,
            customer_id = %ride.customer_id,
            partition = %ride.partition_key(),
            distance_km = ride.distance_km,
            "ride requested"
        );
        ride
    }

    /// Claims the head driver of the ride's pickup queue.
    ///
    /// Fails with [`DispatchError::NoDriverAvailable`] when the queue is empty;
    /// the ride stays `requested` and can be retried.
    pub fn try_assign(&self, ride_id: &RideId) -> DispatchResult<TransitionOutcome> {
        let slot = self.active_slot(ride_id, "be assigned")?;
        let mut ride = slot.lock();
        if ride.state != RideState::Requested {
            return Err(invalid(&ride, "be assigned"));
        }

        let skip = ride.skip_driver.take();
        let key = ride.partition_key();
        let Some(entry) = self.queue.claim_head(&key, skip.as_ref()) else {
            self.telemetry.search_without_driver();
            debug!(ride_id = %ride_id, partition = %key, "no driver available");
            return Err(DispatchError::NoDriverAvailable(key));
        };

        let now = self.clock.now_ms();
        let accept_by = now.saturating_add(self.acceptance_timeout_ms);
        ride.state = RideState::Assigned;
        ride.driver_id = Some(entry.driver_id.clone());
        ride.acceptance_deadline = Some(accept_by);
        ride.timestamps.assigned_at = Some(now);
        self.bound.insert(entry.driver_id.clone(), ride_id.clone());
        self.deadlines.schedule(ride_id.clone(), accept_by);
        self.telemetry.ride_matched();
        info!(
            ride_id = %ride_id,
            driver_id = %entry.driver_id,
            position = entry.position,
            accept_by,
            "ride assigned"
        );

        Ok(TransitionOutcome {
            ride_id: ride_id.clone(),
            state: ride.state,
            events: vec![OutboundEvent::RideAssigned {
                ride_id: ride_id.clone(),
                driver_id: entry.driver_id,
                accept_by,
            }],
        })
    }

    /// Fails with [`DispatchError::AcceptanceTimeout`] once the deadline has
    /// passed; the ride is then reclaimed by [`expire_acceptance`](Self::expire_acceptance).
    pub fn accept(
        &self,
        ride_id: &RideId,
        driver_id: &DriverId,
    ) -> DispatchResult<TransitionOutcome> {
        let slot = self.active_slot(ride_id, "be accepted")?;
        let mut ride = slot.lock();
        if ride.state != RideState::Assigned {
            return Err(invalid(&ride, "be accepted"));
        }
        ensure_assigned_driver(&ride, driver_id)?;
        let now = self.clock.now_ms();
        if is_past(ride.acceptance_deadline, now) {
            return Err(DispatchError::AcceptanceTimeout(ride_id.clone()));
        }

        let start_otp = self.otp_generator.generate();
        ride.state = RideState::Accepted;
        ride.start_otp = Some(start_otp.clone());
        ride.acceptance_deadline = None;
        ride.timestamps.accepted_at = Some(now);
        info!(ride_id = %ride_id, driver_id = %driver_id, "ride accepted");

        Ok(TransitionOutcome {
            ride_id: ride_id.clone(),
            state: ride.state,
            events: vec![OutboundEvent::RideAcceptConfirmed {
                ride_id: ride_id.clone(),
                driver_id: driver_id.clone(),
                start_otp,
            }],
        })
    }

    pub fn decline(
        &self,
        ride_id: &RideId,
        driver_id: &DriverId,
    ) -> DispatchResult<TransitionOutcome> {
        let slot = self.active_slot(ride_id, "be declined")?;
        let mut ride = slot.lock();
        if ride.state != RideState::Assigned {
            return Err(invalid(&ride, "be declined"));
        }
        ensure_assigned_driver(&ride, driver_id)?;
        self.telemetry.driver_declined();
        info!(ride_id = %ride_id, driver_id = %driver_id, "driver declined ride");
        let events = self.reclaim(&mut ride, ReassignReason::Declined);
        Ok(TransitionOutcome {
            ride_id: ride_id.clone(),
            state: ride.state,
            events,
        })
    }

    /// Returns an `assigned` ride whose deadline has passed to `requested`.
    /// `None` when the ride is gone, was accepted, or its deadline is still ahead.
    pub fn expire_acceptance(&self, ride_id: &RideId) -> Option<TransitionOutcome> {
        let slot = self.active.get(ride_id).map(|slot| Arc::clone(slot.value()))?;
        let mut ride = slot.lock();
        let now = self.clock.now_ms();
        if ride.state != RideState::Assigned || !is_past(ride.acceptance_deadline, now) {
            return None;
        }
        self.telemetry.acceptance_timeout();
        info!(
            ride_id = %ride_id,
            driver_id = ?ride.driver_id,
            "acceptance window elapsed"
        );
        let events = self.reclaim(&mut ride, ReassignReason::AcceptanceTimeout);
        Some(TransitionOutcome {
            ride_id: ride_id.clone(),
            state: ride.state,
            events,
        })
    }

    /// Expires every ride whose acceptance deadline is due.
    pub fn expire_due(&self) -> Vec<TransitionOutcome> {
        let now = self.clock.now_ms();
        self.deadlines
            .pop_due(now)
            .into_iter()
            .filter_map(|deadline| self.expire_acceptance(&deadline.ride_id))
            .collect()
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.deadlines.next_deadline()
    }

    /// Verifies the start code and freezes the fare at the pickup's current surge.
    /// A repeat submission after the ride has started changes nothing.
    pub fn submit_start_otp(
        &self,
        ride_id: &RideId,
        code: &str,
    ) -> DispatchResult<TransitionOutcome> {
        let slot = match self.locate(ride_id)? {
            Slot::Active(slot) => slot,
            Slot::Finished(ride) => return finished_outcome(&ride, "start"),
        };
        let mut ride = slot.lock();
        match ride.state {
            RideState::Accepted => {}
            RideState::Started | RideState::Ended | RideState::Completed => {
                return Ok(TransitionOutcome::unchanged(&ride));
            }
            _ => return Err(invalid(&ride, "start")),
        }
        let expected = ride.start_otp.as_deref().unwrap_or_default();
        if !self.otp_verifier.verify(expected, code) {
            self.telemetry.otp_mismatch();
            warn!(ride_id = %ride_id, "start code mismatch");
            return Err(DispatchError::OtpMismatch(ride_id.clone()));
        }

        let surge = self.surge.factor(&ride.pickup_location_id);
        let quote = self
            .fares
            .quote(ride.vehicle_type, ride.distance_km, surge, &self.policy)?;
        let end_otp = self.otp_generator.generate();
        ride.fare = Some(quote);
        ride.start_otp = None;
        ride.end_otp = Some(end_otp.clone());
        ride.state = RideState::Started;
        ride.timestamps.started_at = Some(self.clock.now_ms());
        self.telemetry.ride_started();
        info!(
            ride_id = %ride_id,
            surge,
            driver_fare = quote.driver_fare,
            customer_fare = quote.customer_fare,
            "ride started"
        );

        Ok(TransitionOutcome {
            ride_id: ride_id.clone(),
            state: ride.state,
            events: vec![OutboundEvent::RideStarted {
                ride_id: ride_id.clone(),
                end_otp_hint: end_otp,
            }],
        })
    }

    pub fn submit_end_otp(
        &self,
        ride_id: &RideId,
        code: &str,
    ) -> DispatchResult<TransitionOutcome> {
        let slot = match self.locate(ride_id)? {
            Slot::Active(slot) => slot,
            Slot::Finished(ride) => return finished_outcome(&ride, "end"),
        };
        let mut ride = slot.lock();
        match ride.state {
            RideState::Started => {}
            RideState::Ended | RideState::Completed => {
                return Ok(TransitionOutcome::unchanged(&ride));
            }
            _ => return Err(invalid(&ride, "end")),
        }
        let expected = ride.end_otp.as_deref().unwrap_or_default();
        if !self.otp_verifier.verify(expected, code) {
            self.telemetry.otp_mismatch();
            warn!(ride_id = %ride_id, "end code mismatch");
            return Err(DispatchError::OtpMismatch(ride_id.clone()));
        }

        ride.end_otp = None;
        ride.state = RideState::Ended;
        ride.timestamps.ended_at = Some(self.clock.now_ms());
        info!(ride_id = %ride_id, "ride ended");

        Ok(TransitionOutcome {
            ride_id: ride_id.clone(),
            state: ride.state,
            events: vec![OutboundEvent::RideEnded {
                ride_id: ride_id.clone(),
            }],
        })
    }

    /// Archives the ride and credits the driver. On a store failure the ride
    /// stays `ended` and the call can be retried.
    pub fn complete(&self, ride_id: &RideId) -> DispatchResult<TransitionOutcome> {
        let slot = match self.locate(ride_id)? {
            Slot::Active(slot) => slot,
            Slot::Finished(ride) => return finished_outcome(&ride, "complete"),
        };
        let mut ride = slot.lock();
        if ride.state != RideState::Ended {
            return Err(invalid(&ride, "complete"));
        }
        let (Some(driver_id), Some(fare)) = (ride.driver_id.clone(), ride.fare) else {
            return Err(invalid(&ride, "complete"));
        };

        let now = self.clock.now_ms();
        let mut completed = ride.clone();
        completed.state = RideState::Completed;
        completed.timestamps.completed_at = Some(now);
        let earnings = self
            .ledger
            .record_completion(&driver_id, completed.to_record(now))?;
        *ride = completed;
        self.release(&driver_id, ride_id);
        self.telemetry.ride_completed();
        info!(
            ride_id = %ride_id,
            driver_id = %driver_id,
            driver_fare = fare.driver_fare,
            customer_fare = fare.customer_fare,
            total_earnings = earnings.total_earnings,
            "ride completed"
        );
        self.retire(&ride);

        Ok(TransitionOutcome {
            ride_id: ride_id.clone(),
            state: ride.state,
            events: vec![OutboundEvent::RideCompleted {
                ride_id: ride_id.clone(),
                driver_id,
                driver_fare: fare.driver_fare,
                customer_fare: fare.customer_fare,
            }],
        })
    }

    /// Cancels a ride that has not started. A bound driver goes back to the
    /// tail of the pickup queue.
    pub fn cancel(&self, ride_id: &RideId, actor: &Actor) -> DispatchResult<TransitionOutcome> {
        let slot = self.active_slot(ride_id, "be cancelled")?;
        let mut ride = slot.lock();
        if !ride.state.is_cancellable() {
            return Err(invalid(&ride, "be cancelled"));
        }

        let now = self.clock.now_ms();
        let reason = format!("cancelled by {actor}");
        let released = ride.driver_id.clone();
        let mut cancelled = ride.clone();
        cancelled.state = RideState::Cancelled;
        cancelled.driver_id = None;
        cancelled.released_driver = released.clone();
        cancelled.start_otp = None;
        cancelled.acceptance_deadline = None;
        cancelled.cancel_reason = Some(reason.clone());
        cancelled.timestamps.cancelled_at = Some(now);
        self.ledger.history().append(cancelled.to_record(now))?;

        let mut events = vec![OutboundEvent::RideCancelled {
            ride_id: ride_id.clone(),
            reason,
        }];
        if let Some(driver_id) = released {
            self.release(&driver_id, ride_id);
            events.extend(self.requeue(&ride, &driver_id));
        }
        *ride = cancelled;
        self.telemetry.ride_cancelled();
        info!(ride_id = %ride_id, actor = %actor, "ride cancelled");
        self.retire(&ride);

        Ok(TransitionOutcome {
            ride_id: ride_id.clone(),
            state: ride.state,
            events,
        })
    }

    pub fn get(&self, ride_id: &RideId) -> Option<Ride> {
        match self.locate(ride_id).ok()? {
            Slot::Active(slot) => Some(slot.lock().clone()),
            Slot::Finished(ride) => Some(ride),
        }
    }

    /// Rides waiting for a driver, oldest request first.
    pub fn searching(&self) -> Vec<RideId> {
        self.waiting(|_| true)
    }

    /// Rides waiting for a driver from one queue partition, oldest first.
    pub fn searching_at(&self, key: &PartitionKey) -> Vec<RideId> {
        self.waiting(|ride| {
            ride.pickup_location_id == key.location_id && ride.vehicle_type == key.vehicle_type
        })
    }

    fn waiting(&self, filter: impl Fn(&Ride) -> bool) -> Vec<RideId> {
        // Snapshot the slots first: a ride lock is never taken under a map shard.
        let slots: Vec<_> = self
            .active
            .iter()
            .map(|slot| Arc::clone(slot.value()))
            .collect();
        let mut waiting: Vec<(Timestamp, RideId)> = slots
            .iter()
            .filter_map(|slot| {
                let ride = slot.lock();
                (ride.state == RideState::Requested && filter(&ride))
                    .then(|| (ride.timestamps.requested_at, ride.ride_id.clone()))
            })
            .collect();
        waiting.sort();
        waiting.into_iter().map(|(_, ride_id)| ride_id).collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// The ride a driver is currently bound to, from assignment until the
    /// ride completes, is cancelled or goes back to `requested`.
    pub fn active_ride_of(&self, driver_id: &DriverId) -> Option<RideId> {
        self.bound.get(driver_id).map(|ride| ride.value().clone())
    }

    fn locate(&self, ride_id: &RideId) -> DispatchResult<Slot> {
        if let Some(slot) = self.active.get(ride_id) {
            return Ok(Slot::Active(Arc::clone(slot.value())));
        }
        self.finished
            .lock()
            .peek(ride_id)
            .cloned()
            .map(Slot::Finished)
            .ok_or_else(|| DispatchError::RideNotFound(ride_id.clone()))
    }

    fn active_slot(
        &self,
        ride_id: &RideId,
        action: &'static str,
    ) -> DispatchResult<Arc<Mutex<Ride>>> {
        match self.locate(ride_id)? {
            Slot::Active(slot) => Ok(slot),
            Slot::Finished(ride) => Err(invalid(&ride, action)),
        }
    }

    /// Moves a terminal ride out of the active set. Called with the ride locked;
    /// the finished copy is stored first so lookups never miss it.
    fn retire(&self, ride: &Ride) {
        self.finished.lock().put(ride.ride_id.clone(), ride.clone());
        self.active.remove(&ride.ride_id);
    }

    fn reclaim(&self, ride: &mut Ride, reason: ReassignReason) -> Vec<OutboundEvent> {
        let Some(driver_id) = ride.driver_id.take() else {
            return Vec::new();
        };
        ride.state = RideState::Requested;
        ride.acceptance_deadline = None;
        ride.timestamps.assigned_at = None;
        ride.skip_driver = Some(driver_id.clone());
        self.release(&driver_id, &ride.ride_id);

        let mut events = vec![OutboundEvent::RideReassigning {
            ride_id: ride.ride_id.clone(),
            driver_id: driver_id.clone(),
            reason,
        }];
        events.extend(self.requeue(ride, &driver_id));
        events
    }

    fn release(&self, driver_id: &DriverId, ride_id: &RideId) {
        self.bound.remove_if(driver_id, |_, bound_to| bound_to == ride_id);
    }

    fn requeue(&self, ride: &Ride, driver_id: &DriverId) -> Option<OutboundEvent> {
        match self
            .queue
            .enqueue(driver_id, &ride.pickup_location_id, ride.vehicle_type)
        {
            Ok(entry) => Some(OutboundEvent::QueuePositionChanged {
                driver_id: entry.driver_id,
                location_id: entry.location_id,
                vehicle_type: entry.vehicle_type,
                position: entry.position,
            }),
            Err(err) => {
                warn!(
                    ride_id = %ride.ride_id,
                    driver_id = %driver_id,
                    error = %err,
                    "driver not returned to queue"
                );
                None
            }
        }
    }
}

fn invalid(ride: &Ride, action: &'static str) -> DispatchError {
    DispatchError::InvalidTransition {
        ride_id: ride.ride_id.clone(),
        current: ride.state,
        action,
    }
}

fn ensure_assigned_driver(ride: &Ride, driver_id: &DriverId) -> DispatchResult<()> {
    if ride.driver_id.as_ref() == Some(driver_id) {
        Ok(())
    } else {
        Err(DispatchError::NotAssignedDriver {
            ride_id: ride.ride_id.clone(),
            driver_id: driver_id.clone(),
        })
    }
}

/// A completed ride has passed every step, so repeats of any of them are no-ops.
fn finished_outcome(ride: &Ride, action: &'static str) -> DispatchResult<TransitionOutcome> {
    if ride.state == RideState::Completed {
        Ok(TransitionOutcome::unchanged(ride))
    } else {
        Err(invalid(ride, action))
    }
}

fn is_past(deadline: Option<Timestamp>, now: Timestamp) -> bool {
    deadline.is_some_and(|at| now >= at)
}
