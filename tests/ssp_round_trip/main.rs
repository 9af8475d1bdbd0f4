//! Client to server round trips over the in-memory bus
//!
//! Every test starts a full `LocalCluster` (server threads and bg workers on
//! their own threads), drives it through `AppThread` handles and shuts it
//! down by deregistering every app thread.
//!
//! ```bash
//! cargo test --test ssp_round_trip
//! ```

use sspps::prelude::*;

mod consistency;
mod multi_client;

// =============================================================================
// SHARED TEST UTILITIES
// =============================================================================

pub const TABLE: TableId = 0;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn dense_table(columns: usize, staleness: i32) -> ClientTableConfig {
    ClientTableConfig {
        table_info: TableInfo::dense(DENSE_F32, columns, staleness),
        ..ClientTableConfig::default()
    }
}

pub fn start(config: PsConfig, table: ClientTableConfig) -> LocalCluster {
    init_tracing();
    LocalCluster::builder()
        .config(config)
        .table(TABLE, table)
        .start()
        .unwrap()
}

// =============================================================================
// SINGLE CLIENT
// =============================================================================

#[test]
fn test_inc_clock_then_read() {
    let cluster = start(PsConfig::default(), dense_table(4, 0));
    let mut app = cluster.app(0).unwrap();

    app.inc(TABLE, 3, 1, 0.5f32).unwrap();
    app.clock().unwrap();
    assert_eq!(app.get_value(TABLE, 3, 1).unwrap(), 0.5);
    assert_eq!(app.get_value(TABLE, 3, 0).unwrap(), 0.0);

    // cached rows show local writes right away
    app.inc(TABLE, 3, 1, 1.0f32).unwrap();
    assert_eq!(app.get_value(TABLE, 3, 1).unwrap(), 1.5);

    app.deregister().unwrap();
    cluster.join().unwrap();
}

#[test]
fn test_untouched_row_reads_zero() {
    let cluster = start(PsConfig::default(), dense_table(2, 1));
    let app = cluster.app(0).unwrap();
    assert_eq!(app.get_value(TABLE, 42, 1).unwrap(), 0.0);
    app.deregister().unwrap();
    cluster.join().unwrap();
}

#[test]
fn test_reads_right_after_start() {
    let config = PsConfig {
        num_servers: 2,
        num_comm_channels_per_client: 2,
        ..PsConfig::default()
    };
    for round in 0..8 {
        let cluster = start(config.clone(), dense_table(2, 0));
        let app = cluster.app(0).unwrap();
        for row_id in 0..4 {
            assert_eq!(app.get_value(TABLE, row_id, 0).unwrap(), 0.0, "round {round}");
        }
        app.deregister().unwrap();
        cluster.join().unwrap();
    }
}

#[test]
fn test_wrong_element_width_is_rejected() {
    let cluster = start(PsConfig::default(), dense_table(4, 0));
    let mut app = cluster.app(0).unwrap();

    let err = app.inc(TABLE, 3, 1, 1.0f64).unwrap_err();
    assert!(err.is_invalid_update());
    let err = app.batch_inc(TABLE, 3, &[0, 1], &[1i64, 2]).unwrap_err();
    assert!(err.is_invalid_update());
    app.inc(TABLE, 3, 1, 2.0f32).unwrap();
    app.clock().unwrap();

    assert_eq!(app.get_value(TABLE, 3, 1).unwrap(), 2.0);
    assert_eq!(app.get_value(TABLE, 3, 0).unwrap(), 0.0);
    app.deregister().unwrap();
    cluster.join().unwrap();
}

#[test]
fn test_column_outside_row_is_rejected() {
    let cluster = start(PsConfig::default(), dense_table(4, 0));
    let mut app = cluster.app(0).unwrap();

    assert!(app.inc(TABLE, 1, 4, 1.0f32).unwrap_err().is_invalid_update());
    assert!(app.inc(TABLE, 1, -1, 1.0f32).unwrap_err().is_invalid_update());
    assert!(app
        .batch_inc(TABLE, 1, &[0, 9], &[1.0f32, 1.0])
        .unwrap_err()
        .is_invalid_update());
    assert!(app
        .dense_batch_inc(TABLE, 1, &[1.0f32, 1.0], 3)
        .unwrap_err()
        .is_invalid_update());
    app.dense_batch_inc(TABLE, 1, &[1.0f32, 1.0], 2).unwrap();
    app.clock().unwrap();

    for (column_id, expected) in [(0, 0.0), (1, 0.0), (2, 1.0), (3, 1.0)] {
        assert_eq!(app.get_value(TABLE, 1, column_id).unwrap(), expected);
    }
    app.deregister().unwrap();
    cluster.join().unwrap();
}

#[test]
fn test_unknown_table_is_rejected() {
    let cluster = start(PsConfig::default(), dense_table(2, 1));
    let app = cluster.app(0).unwrap();
    let err = app.inc(7, 0, 0, 1.0f32).unwrap_err();
    assert!(matches!(err, Error::UnknownTable(7)));
    assert!(cluster.app(5).unwrap_err().is_config());
    app.deregister().unwrap();
    cluster.join().unwrap();
}

#[test]
fn test_batch_updates_over_many_rows() {
    let config = PsConfig {
        num_servers: 2,
        num_comm_channels_per_client: 2,
        ..PsConfig::default()
    };
    let cluster = start(config, dense_table(3, 0));
    let mut app = cluster.app(0).unwrap();

    for row_id in 0..16 {
        app.batch_inc(TABLE, row_id, &[0, 2], &[row_id as f32, 1.0])
            .unwrap();
    }
    app.dense_batch_inc(TABLE, 5, &[10.0f32, 10.0], 1).unwrap();
    app.clock().unwrap();

    for row_id in 0..16 {
        assert_eq!(app.get_value(TABLE, row_id, 0).unwrap(), row_id as f64);
        assert_eq!(app.get_value(TABLE, row_id, 2).unwrap(), if row_id == 5 { 11.0 } else { 1.0 });
    }
    assert_eq!(app.get_value(TABLE, 5, 1).unwrap(), 10.0);

    app.deregister().unwrap();
    cluster.join().unwrap();
}
