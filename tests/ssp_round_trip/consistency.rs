//! Behavior under each consistency model

use crate::{dense_table, start, TABLE};
use sspps::prelude::*;
use std::thread;
use std::time::Duration;

fn run_clocks(model: ConsistencyModel, staleness: i32, clocks: i32) {
    let config = PsConfig {
        consistency_model: model,
        ..PsConfig::default()
    };
    let cluster = start(config, dense_table(2, staleness));
    let mut app = cluster.app(0).unwrap();

    for clock in 1..=clocks {
        app.inc(TABLE, 0, 0, 1.0f32).unwrap();
        app.clock().unwrap();
        let value = app.get_value(TABLE, 0, 0).unwrap();
        assert!(
            value >= f64::from(clock - staleness) && value <= f64::from(clock),
            "clock {clock}: read {value}"
        );
    }

    app.deregister().unwrap();
    cluster.join().unwrap();
}

#[test]
fn test_ssp_reads_within_staleness() {
    run_clocks(ConsistencyModel::Ssp, 2, 6);
}

#[test]
fn test_ssp_push_reads_within_staleness() {
    run_clocks(ConsistencyModel::SspPush, 1, 6);
}

#[test]
fn test_ssp_aggr_reads_within_staleness() {
    run_clocks(ConsistencyModel::SspAggr, 2, 6);
}

#[test]
fn test_zero_staleness_is_exact() {
    run_clocks(ConsistencyModel::SspAggr, 0, 4);
}

#[test]
fn test_early_comm_ships_between_clocks() {
    let config = PsConfig {
        suppression_on: true,
        ..PsConfig::default()
    };
    let cluster = start(config, dense_table(2, 4));
    let mut app = cluster.app(0).unwrap();
    app.early_comm_on().unwrap();

    for row_id in 0..8 {
        app.inc(TABLE, row_id, 1, 2.0f32).unwrap();
    }
    // leave the bg worker idle long enough to ship on its own
    thread::sleep(Duration::from_millis(50));
    app.clock().unwrap();
    for row_id in 0..8 {
        assert_eq!(app.get_value(TABLE, row_id, 1).unwrap(), 2.0);
    }

    app.early_comm_off().unwrap();
    app.deregister().unwrap();
    cluster.join().unwrap();
}

#[test]
fn test_send_oplog_without_clock() {
    let cluster = start(PsConfig::default(), dense_table(2, 0));
    let mut app = cluster.app(0).unwrap();
    app.inc(TABLE, 1, 0, 4.0f32).unwrap();
    app.send_oplog().unwrap();
    app.clock().unwrap();
    assert_eq!(app.get_value(TABLE, 1, 0).unwrap(), 4.0);
    app.deregister().unwrap();
    cluster.join().unwrap();
}
