//! End-to-end tests against a real Octave. Each test returns early when no
//! Octave installation can be found.

use std::{collections::BTreeMap, time::Duration};

use octbridge_core::{
    CellArray, CommandRequest, EngineRef, Nout, NumericArray, NumericKind, SessionConfig,
    SparseMatrix, StructArray, Value,
};
use octbridge_session::{Session, SessionError};
use tokio_test::assert_ok;

async fn octave() -> Option<Session> {
    let session = Session::new(SessionConfig::new().with_startup_timeout(Duration::from_secs(120)));
    match session.start().await {
        Ok(()) => Some(session),
        Err(SessionError::Startup(reason)) => {
            eprintln!("skipping: {reason}");
            None
        }
        Err(e) => panic!("unexpected startup failure: {e}"),
    }
}

fn write_function(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.join(format!("{name}.m"));
    std::fs::write(&path, body).unwrap();
    path
}

#[tokio::test]
async fn test_zeros() {
    let Some(session) = octave().await else { return };
    let value = session.call("zeros", vec![Value::from(3.0)]).await.unwrap();
    let matrix = value.as_numeric().unwrap();
    assert_eq!(matrix.dims(), &[3, 3]);
    assert_eq!(matrix.kind(), NumericKind::Double);
    assert!(matrix.real().to_f64_vec().iter().all(|x| *x == 0.0));
    assert_ok!(session.close().await);
}

#[tokio::test]
async fn test_roundtrip_with_class_label() {
    let Some(session) = octave().await else { return };
    let dir = tempfile::tempdir().unwrap();
    let path = write_function(
        dir.path(),
        "roundtrip",
        "function [x, cls] = roundtrip(y)\n  x = y;\n  cls = class(x);\nend\n",
    );

    let input = Value::from(NumericArray::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap());
    let out = session
        .feval(&path.to_string_lossy(), vec![input.clone()], 2)
        .await
        .unwrap();
    assert_eq!(out, vec![input, Value::from("double")]);

    let out = session
        .feval(&path.to_string_lossy(), vec![Value::from(1.0)], 5)
        .await
        .unwrap();
    assert_eq!(out.len(), 2);
    assert_ok!(session.close().await);
}

#[tokio::test]
async fn test_value_roundtrips() {
    let Some(session) = octave().await else { return };

    let mut record = BTreeMap::new();
    record.insert("name".to_string(), Value::from("sample"));
    record.insert(
        "limits".to_string(),
        Value::from(vec![Value::from(1.5), Value::from("high")]),
    );
    let mut nested = BTreeMap::new();
    nested.insert("depth".to_string(), Value::from(2u8));
    record.insert("inner".to_string(), Value::Struct(nested));

    let mut a = BTreeMap::new();
    a.insert("id".to_string(), Value::from(1.0));
    let mut b = BTreeMap::new();
    b.insert("id".to_string(), Value::from(2.0));

    let cube: Vec<f64> = (0..12).map(f64::from).collect();
    let values = vec![
        Value::from(2.5),
        Value::from(NumericArray::new(&[2, 3, 2], cube).unwrap()),
        Value::from(NumericArray::row(vec![-3i16, 7, 300])),
        Value::from(NumericArray::row(vec![u64::MAX, 0])),
        Value::from(NumericArray::row(vec![true, false, true])),
        Value::from(NumericArray::complex(&[1, 2], vec![1.0, -2.0], vec![0.5, 3.0]).unwrap()),
        Value::from("plain text"),
        Value::from("grüße ✓"),
        Value::from(CellArray::row(vec![Value::from(1.0), Value::from(vec![Value::from("x")])])),
        Value::Struct(record),
        Value::from(StructArray::from_records(vec![a, b]).unwrap()),
        Value::from(SparseMatrix::from_triplets(3, 4, &[(0, 0, 1.0), (2, 3, -4.5)]).unwrap()),
        Value::Empty,
    ];

    for (i, value) in values.into_iter().enumerate() {
        let name = format!("v{i}");
        session.push(&name, value.clone()).await.unwrap();
        let back = session.pull(&name).await.unwrap();
        assert_eq!(back, value, "value {i} changed on the round trip");
    }
    assert_ok!(session.close().await);
}

#[tokio::test]
async fn test_output_count_policy() {
    let Some(session) = octave().await else { return };
    let dir = tempfile::tempdir().unwrap();
    write_function(
        dir.path(),
        "three_out",
        "function [a, b, c] = three_out()\n  a = 1; b = 2; c = 3;\nend\n",
    );
    write_function(
        dir.path(),
        "touch_global",
        "function touch_global()\n  global OB_TOUCHED\n  OB_TOUCHED = 1;\nend\n",
    );
    session.add_path(dir.path()).await.unwrap();

    assert_eq!(session.feval("three_out", vec![], Nout::Max).await.unwrap().len(), 3);
    assert_eq!(session.feval("three_out", vec![], 2).await.unwrap().len(), 2);
    assert_eq!(session.feval("three_out", vec![], 10).await.unwrap().len(), 3);

    assert!(session.feval("touch_global", vec![], 0).await.unwrap().is_empty());
    let touched = session.eval("global OB_TOUCHED; OB_TOUCHED").await.unwrap();
    assert_eq!(touched, Some(Value::from(1.0)));

    assert_eq!(session.call("sin", vec![Value::from(0.0)]).await.unwrap(), Value::from(0.0));
    assert_eq!(session.feval("zeros", vec![Value::from(2.0)], 2).await.unwrap().len(), 1);
    assert_eq!(session.feval("sin", vec![Value::from(0.0)], Nout::Max).await.unwrap().len(), 1);
    let dims = session.feval("size", vec![Value::from(1.0)], 3).await.unwrap();
    assert_eq!(dims, vec![Value::from(1.0); 3]);
    session.remove_path(dir.path()).await.unwrap();
    assert_ok!(session.close().await);
}

#[tokio::test]
async fn test_functions_defined_later_resolve() {
    let Some(session) = octave().await else { return };
    let dir = tempfile::tempdir().unwrap();

    let err = session.call("later_fn", vec![]).await.unwrap_err();
    assert!(err.engine_message().unwrap().contains("'later_fn' undefined"));

    write_function(dir.path(), "later_fn", "function y = later_fn()\n  y = 11;\nend\n");
    session.add_path(dir.path()).await.unwrap();
    assert_eq!(session.call("later_fn", vec![]).await.unwrap(), Value::from(11.0));
    assert_ok!(session.close().await);
}

#[tokio::test]
async fn test_errors_and_eval() {
    let Some(session) = octave().await else { return };

    let err = session
        .call("error", vec![Value::from("my:id"), Value::from("custom failure")])
        .await
        .unwrap_err();
    assert_eq!(err.engine_message(), Some("custom failure"));

    assert_eq!(session.eval("x = 3;").await.unwrap(), None);
    assert_eq!(session.eval("x * 2").await.unwrap(), Some(Value::from(6.0)));
    assert_eq!(session.pull("x").await.unwrap(), Value::from(3.0));
    assert!(session.exists("sin").await.unwrap() > 0);
    assert_eq!(session.exists("no_such_thing_here").await.unwrap(), 0);

    let request = CommandRequest::call("ones").arg(2.0).store_as("stored");
    assert!(session.execute(request).await.unwrap().values.is_empty());
    let stored = session.pull("stored").await.unwrap();
    assert_eq!(stored.as_numeric().unwrap().dims(), &[2, 2]);
    assert_ok!(session.close().await);
}

#[tokio::test]
async fn test_references_stay_in_engine() {
    let Some(session) = octave().await else { return };

    let handle = session.pull("sin").await.unwrap();
    assert_eq!(handle, Value::from(EngineRef::function("sin")));
    let is_handle = session.call("is_function_handle", vec![handle.clone()]).await.unwrap();
    assert_eq!(is_handle, Value::from(true));
    let args = vec![handle, Value::from(0.0)];
    assert_eq!(session.call("feval", args).await.unwrap(), Value::from(0.0));

    session.eval("kept = 7;").await.unwrap();
    let kept = session.get_ref("kept").await.unwrap();
    assert_eq!(kept, EngineRef::variable("kept"));
    let args = vec![Value::from(kept), Value::from(1.0)];
    assert_eq!(session.call("plus", args).await.unwrap(), Value::from(8.0));

    let err = session.get_ref("no_such_thing_here").await.unwrap_err();
    assert!(matches!(err, SessionError::Undefined(_)));
    assert_ok!(session.close().await);
}

#[tokio::test]
async fn test_timeout_recovery() {
    let Some(session) = octave().await else { return };
    let pid = session.pid().await;

    let request = CommandRequest::call("pause")
        .arg(30.0)
        .nout(0)
        .timeout(Duration::from_secs(1));
    let err = session.execute(request).await.unwrap_err();
    assert!(err.is_timeout());

    let sum = session.call("plus", vec![Value::from(1.0), Value::from(2.0)]).await.unwrap();
    assert_eq!(sum, Value::from(3.0));
    assert_eq!(session.pid().await, pid);
    assert_ok!(session.close().await);
}

#[tokio::test]
async fn test_run_script_changes_directory_temporarily() {
    let Some(session) = octave().await else { return };
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("setup_vars.m");
    std::fs::write(&script, "script_ran = 42;\n").unwrap();

    let before = session.call("pwd", vec![]).await.unwrap();
    session.run_script(&script).await.unwrap();
    assert_eq!(session.pull("script_ran").await.unwrap(), Value::from(42.0));
    assert_eq!(session.call("pwd", vec![]).await.unwrap(), before);
    assert_ok!(session.close().await);
}
