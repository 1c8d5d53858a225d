mod support;

use dispatch_core::events::{InboundEvent, OutboundEvent};
use dispatch_core::model::{Actor, CustomerId, DriverId, RideId, VehicleType};
use dispatch_core::ride::RideState;
use dispatch_core::store::HistoryStore;
use dispatch_core::test_helpers::{assigned_driver, TestDispatch, MG_ROAD};
use support::fixtures::{accept, drivers_online, positions};

fn cancel(dispatch: &TestDispatch, ride_id: &RideId, actor: Actor) -> Vec<OutboundEvent> {
    dispatch.send(InboundEvent::RideCancel {
        ride_id: ride_id.clone(),
        actor,
    })
}

fn customer() -> Actor {
    Actor::Customer(CustomerId::new("c-1"))
}

#[test]
fn cancel_while_searching_archives_the_ride() {
    let dispatch = TestDispatch::new();
    let (ride_id, _) = dispatch.request_ride("c-1", MG_ROAD, VehicleType::Auto);

    let events = cancel(&dispatch, &ride_id, customer());
    assert_eq!(
        events,
        vec![OutboundEvent::RideCancelled {
            ride_id: ride_id.clone(),
            reason: "cancelled by customer:c-1".to_string(),
        }]
    );
    assert_eq!(dispatch.ride(&ride_id).state, RideState::Cancelled);
    assert_eq!(dispatch.coordinator.rides().active_count(), 0);
    assert_eq!(
        dispatch
            .history
            .find_by_status(RideState::Cancelled)
            .expect("history")
            .len(),
        1
    );
}

#[test]
fn cancel_after_assignment_returns_driver_to_the_tail() {
    let dispatch = TestDispatch::new();
    let drivers = drivers_online(&dispatch, "d", 2, MG_ROAD, VehicleType::Auto);
    let (ride_id, _) = dispatch.request_ride("c-1", MG_ROAD, VehicleType::Auto);
    accept(&dispatch, &ride_id, &drivers[0]);

    let events = cancel(&dispatch, &ride_id, Actor::Driver(drivers[0].clone()));
    assert_eq!(positions(&events), vec![("d-1".to_string(), 3)]);
    assert_eq!(
        dispatch
            .coordinator
            .queue()
            .peek_head(&MG_ROAD.into(), VehicleType::Auto),
        Some(drivers[1].clone())
    );
    assert_eq!(dispatch.coordinator.telemetry().snapshot().rides_cancelled, 1);
}

#[test]
fn released_driver_serves_a_waiting_ride() {
    let dispatch = TestDispatch::new();
    let drivers = drivers_online(&dispatch, "d", 1, MG_ROAD, VehicleType::Bike);
    let (first, _) = dispatch.request_ride("c-1", MG_ROAD, VehicleType::Bike);
    let (second, events) = dispatch.request_ride("c-2", MG_ROAD, VehicleType::Bike);
    assert!(events.contains(&OutboundEvent::RideSearching {
        ride_id: second.clone()
    }));

    let events = cancel(&dispatch, &first, customer());
    assert_eq!(assigned_driver(&events, &second).as_ref(), Some(&drivers[0]));
}

#[test]
fn started_ride_cannot_be_cancelled() {
    let dispatch = TestDispatch::new();
    drivers_online(&dispatch, "d", 1, MG_ROAD, VehicleType::Auto);
    let (ride_id, _) = dispatch.request_ride("c-1", MG_ROAD, VehicleType::Auto);
    dispatch.drive_to_end(&ride_id, "d-1");

    let err = dispatch
        .try_send(InboundEvent::RideCancel {
            ride_id: ride_id.clone(),
            actor: Actor::Admin("ops".to_string()),
        })
        .expect_err("ended rides are not cancellable");
    assert_eq!(err.current_state(), Some(RideState::Ended));
    assert!(!dispatch.coordinator.queue().is_queued(&DriverId::new("d-1")));
}

#[test]
fn second_cancel_reports_the_terminal_state() {
    let dispatch = TestDispatch::new();
    let (ride_id, _) = dispatch.request_ride("c-1", MG_ROAD, VehicleType::Cab);
    cancel(&dispatch, &ride_id, customer());

    let err = dispatch
        .try_send(InboundEvent::RideCancel {
            ride_id: ride_id.clone(),
            actor: Actor::System,
        })
        .expect_err("already cancelled");
    assert_eq!(err.current_state(), Some(RideState::Cancelled));
}

#[test]
fn cancelled_rides_earn_nothing() {
    let dispatch = TestDispatch::new();
    let drivers = drivers_online(&dispatch, "d", 1, MG_ROAD, VehicleType::Auto);
    let (ride_id, _) = dispatch.request_ride("c-1", MG_ROAD, VehicleType::Auto);
    accept(&dispatch, &ride_id, &drivers[0]);
    cancel(&dispatch, &ride_id, customer());

    let folded = dispatch
        .coordinator
        .ledger()
        .fold_history(&drivers[0])
        .expect("fold");
    assert_eq!(folded.total_rides, 0);
    assert_eq!(folded.total_earnings, 0);
}

#[test]
fn cancelled_ride_no_longer_names_a_driver() {
    for accept_first in [false, true] {
        let dispatch = TestDispatch::new();
        let drivers = drivers_online(&dispatch, "d", 1, MG_ROAD, VehicleType::Auto);
        let (ride_id, _) = dispatch.request_ride("c-1", MG_ROAD, VehicleType::Auto);
        if accept_first {
            accept(&dispatch, &ride_id, &drivers[0]);
        }
        cancel(&dispatch, &ride_id, customer());

        let ride = dispatch.ride(&ride_id);
        assert_eq!(ride.state, RideState::Cancelled);
        assert_eq!(ride.driver_id, None);
        assert_eq!(ride.released_driver.as_ref(), Some(&drivers[0]));
        let record = dispatch.history.find_by_ride(&ride_id).expect("archived");
        assert_eq!(record.driver_id, None);
        assert_eq!(dispatch.coordinator.rides().active_ride_of(&drivers[0]), None);
    }
}
