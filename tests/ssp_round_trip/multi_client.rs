//! Several client processes and app threads sharing rows

use crate::{dense_table, start, TABLE};
use sspps::prelude::*;
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn test_clients_see_each_others_updates() {
    let config = PsConfig {
        num_clients: 2,
        ..PsConfig::default()
    };
    let cluster = start(config, dense_table(2, 0));
    let apps = vec![cluster.app(0).unwrap(), cluster.app(1).unwrap()];

    let handles: Vec<_> = apps
        .into_iter()
        .enumerate()
        .map(|(i, mut app)| {
            thread::spawn(move || {
                app.inc(TABLE, 7, 0, (i + 1) as f32).unwrap();
                app.clock().unwrap();
                // zero staleness waits for both clients' first clock
                let value = app.get_value(TABLE, 7, 0).unwrap();
                app.deregister().unwrap();
                value
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), 3.0);
    }
    cluster.join().unwrap();
}

#[test]
fn test_app_threads_share_process_clock() {
    let config = PsConfig {
        num_comm_channels_per_client: 2,
        ..PsConfig::default()
    };
    let cluster = start(config, dense_table(1, 0));
    let apps = vec![cluster.app(0).unwrap(), cluster.app(0).unwrap()];
    let barrier = Arc::new(Barrier::new(apps.len()));

    let handles: Vec<_> = apps
        .into_iter()
        .map(|mut app| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                for row_id in 0..4 {
                    app.inc(TABLE, row_id, 0, 1.0f32).unwrap();
                }
                app.clock().unwrap();
                barrier.wait();
                let values: Vec<f64> = (0..4)
                    .map(|row_id| app.get_value(TABLE, row_id, 0).unwrap())
                    .collect();
                app.deregister().unwrap();
                values
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), vec![2.0; 4]);
    }
    cluster.join().unwrap();
}
