//! Linked ranges exercised through the application's path router, plus the
//! serialization guarantee for concurrent writers.

use std::sync::Arc;
use std::thread;

use labkit::app::App;
use labkit::range::RangeConfig;
use labkit::value::Value;

#[test]
fn range_fields_stay_consistent_through_the_router() {
    let app = App::new("scope");
    let range = app
        .settings()
        .new_range(
            "scan",
            RangeConfig {
                min: 0.0,
                max: 10.0,
                num: 5,
                center_span: true,
                unit: Some("um".into()),
            },
        )
        .unwrap();

    assert_eq!(app.read_setting("app/scope/scan_step").unwrap(), Value::Float(2.5));

    // A settings file writes the step; num follows.
    app.write_setting("app/scope/scan_step", 1.0).unwrap();
    assert_eq!(app.read_setting("app/scope/scan_num").unwrap(), Value::Int(11));

    // Degenerate inputs resolve instead of dividing by zero.
    app.write_setting("app/scope/scan_num", 1).unwrap();
    assert_eq!(app.read_setting("app/scope/scan_num").unwrap(), Value::Int(2));

    app.write_setting("app/scope/scan_num", 11).unwrap();
    app.write_setting("app/scope/scan_center", 20.0).unwrap();
    assert_eq!(app.read_setting("app/scope/scan_min").unwrap(), Value::Float(15.0));
    assert_eq!(app.read_setting("app/scope/scan_max").unwrap(), Value::Float(25.0));

    assert_eq!(range.array().len(), 11);
}

#[test]
fn concurrent_writers_are_serialized_not_dropped() {
    let app = App::new("scope");
    let range = app
        .settings()
        .new_range("x", RangeConfig::default())
        .unwrap();

    let min = range.min();
    let max = range.max();

    let writer_a = {
        let min = Arc::clone(&min);
        thread::spawn(move || {
            for i in 0..100 {
                min.set(-(i as f64) * 0.25).unwrap();
            }
        })
    };
    let writer_b = {
        let max = Arc::clone(&max);
        thread::spawn(move || {
            for i in 0..100 {
                max.set(10.0 + (i as f64) * 0.25).unwrap();
            }
        })
    };
    writer_a.join().unwrap();
    writer_b.join().unwrap();

    // Whatever the interleaving, the last batch recomputed from the final
    // stored endpoints, so the derived fields are consistent.
    let lo = range.min().value().as_f64().unwrap();
    let hi = range.max().value().as_f64().unwrap();
    let num = range.num().value().as_i64().unwrap();
    let step = range.step().value().as_f64().unwrap();

    assert_eq!(lo, -24.75);
    assert_eq!(hi, 34.75);
    assert!((step - (hi - lo) / ((num - 1) as f64)).abs() < 1e-9);
}
