//! End-to-end tests that actually spawn worker processes. Requires the
//! `test-support` feature so this test binary bootstraps into worker mode
//! when re-exec'd (`cargo test --features test-support`).
#![cfg(feature = "test-support")]

use std::num::NonZeroUsize;
use std::thread;
use std::time::Duration;

use procmap::task::{MapFn, Outcome};
use procmap::{register_worker_fn, Pool};

struct Square;

impl MapFn for Square {
    type Args = i64;
    type Output = i64;
    const NAME: &'static str = "procmap::tests::square";

    fn call(x: i64) -> Result<i64, String> {
        Ok(x * x)
    }
}

register_worker_fn!(Square);

struct ScaleTuple;

impl MapFn for ScaleTuple {
    type Args = (String, i64);
    type Output = (String, i64);
    const NAME: &'static str = "procmap::tests::scale_tuple";

    fn call((label, value): (String, i64)) -> Result<(String, i64), String> {
        Ok((label, value * value))
    }
}

register_worker_fn!(ScaleTuple);

struct ReciprocalOf;

impl MapFn for ReciprocalOf {
    type Args = i64;
    type Output = f64;
    const NAME: &'static str = "procmap::tests::reciprocal";

    fn call(x: i64) -> Result<f64, String> {
        if x == 0 {
            Err("division by zero".to_string())
        } else {
            Ok(1.0 / x as f64)
        }
    }
}

register_worker_fn!(ReciprocalOf);

struct SleepMillis;

impl MapFn for SleepMillis {
    type Args = u64;
    type Output = u64;
    const NAME: &'static str = "procmap::tests::sleep_millis";

    fn call(millis: u64) -> Result<u64, String> {
        thread::sleep(Duration::from_millis(millis));
        Ok(millis)
    }
}

register_worker_fn!(SleepMillis);

#[test]
fn ordered_identity_matches_serial_evaluation() {
    let mut pool = Pool::<Square>::new(NonZeroUsize::new(4), None);
    pool.start().unwrap();

    let inputs: Vec<i64> = (0..10).collect();
    let results: Vec<_> = pool
        .imap(inputs.clone())
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    pool.stop().unwrap();

    let expected: Vec<_> = inputs.iter().map(|x| Outcome::Value(x * x)).collect();
    assert_eq!(results, expected);
}

#[test]
fn unordered_mode_is_a_permutation_of_serial_evaluation() {
    let mut pool = Pool::<Square>::new(NonZeroUsize::new(4), None);
    pool.start().unwrap();

    let inputs: Vec<i64> = (0..10).collect();
    let mut results: Vec<_> = pool
        .imap_unordered(inputs.clone())
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    pool.stop().unwrap();

    let mut expected: Vec<_> = inputs.iter().map(|x| x * x).collect();
    let mut actual: Vec<_> = results.drain(..).map(|outcome| outcome.value().unwrap()).collect();
    expected.sort_unstable();
    actual.sort_unstable();
    assert_eq!(actual, expected);
}

#[test]
fn tuple_arguments_round_trip() {
    let mut pool = Pool::<ScaleTuple>::new(NonZeroUsize::new(2), None);
    pool.start().unwrap();

    let inputs = vec![
        ("a".to_string(), 1i64),
        ("b".to_string(), 2),
        ("c".to_string(), 3),
    ];
    let results: Vec<_> = pool
        .imap(inputs)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    pool.stop().unwrap();

    assert_eq!(
        results,
        vec![
            Outcome::Value(("a".to_string(), 1)),
            Outcome::Value(("b".to_string(), 4)),
            Outcome::Value(("c".to_string(), 9)),
        ]
    );
}

#[test]
fn worker_error_is_delivered_as_a_value_not_an_abort() {
    let mut pool = Pool::<ReciprocalOf>::new(NonZeroUsize::new(2), None);
    pool.start().unwrap();

    let results: Vec<_> = pool
        .imap(vec![2i64, 0, 4])
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    pool.stop().unwrap();

    assert_eq!(results.len(), 3);
    assert!(results[0].is_value());
    assert!(results[1].is_worker_error());
    assert!(results[2].is_value());
}

#[test]
fn task_exceeding_timeout_is_reported_and_worker_is_replaced() {
    let mut pool = Pool::<SleepMillis>::new(NonZeroUsize::new(2), Some(Duration::from_millis(80)));
    pool.start().unwrap();

    let results: Vec<_> = pool
        .imap(vec![10u64, 300, 10, 300])
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    pool.stop().unwrap();

    assert_eq!(results.len(), 4);
    assert!(results[0].is_value());
    assert!(results[1].is_timeout());
    assert!(results[2].is_value());
    assert!(results[3].is_timeout());
}

#[test]
fn empty_input_produces_no_output() {
    let mut pool = Pool::<Square>::new(NonZeroUsize::new(3), None);
    pool.start().unwrap();

    let results: Vec<_> = pool
        .imap(Vec::<i64>::new())
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    pool.stop().unwrap();

    assert!(results.is_empty());
}

#[test]
fn malformed_input_aborts_the_stream_with_an_error() {
    let mut pool = Pool::<Square>::new(NonZeroUsize::new(2), None);
    pool.start().unwrap();

    let inputs: Vec<Result<i64, String>> =
        vec![Ok(1), Ok(2), Err("bad row".to_string()), Ok(4)];
    let mut iter = pool.try_imap(inputs).unwrap();

    let mut saw_error = false;
    for item in &mut iter {
        if item.is_err() {
            saw_error = true;
            break;
        }
    }
    drop(iter);

    pool.stop().unwrap();
    assert!(saw_error);
}

#[test]
fn dropping_a_partially_consumed_map_frees_the_pool_for_reuse() {
    let mut pool = Pool::<Square>::new(NonZeroUsize::new(2), None);
    pool.start().unwrap();

    {
        let mut first = pool.imap(vec![1i64, 2, 3]).unwrap();
        // Only take the first result; the rest of the stream is abandoned
        // when `first` is dropped at the end of this block.
        assert!(first.next().is_some());
    }

    // The pool must be usable again now that the previous iterator (and
    // its in-flight tasks) has been dropped.
    let results: Vec<_> = pool
        .imap(vec![4i64, 5, 6])
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    pool.stop().unwrap();

    assert_eq!(
        results,
        vec![Outcome::Value(16), Outcome::Value(25), Outcome::Value(36)]
    );
}
