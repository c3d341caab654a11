// Job building tests - lifecycle ordering, contexts, attribute queries, ids

use oxflow::prelude::*;
use oxflow::{Error, InterfaceBlobConf, Lifecycle, ParallelConf};

fn session() -> Runtime {
    let mut rt = Runtime::new();
    rt.init_env(EnvConfig::default()).unwrap();
    rt.init_global_session(SessionConfig::default()).unwrap();
    rt
}

fn input_op(name: &str, shape: impl Into<Shape>) -> OperatorConf {
    OperatorConf::input(name, InterfaceBlobConf::new(shape.into(), DType::F32))
}

// Lifecycle

#[test]
fn test_start_before_init_fails() {
    let mut rt = Runtime::new();
    rt.init_env(EnvConfig::default()).unwrap();
    assert!(matches!(
        rt.start_global_session(),
        Err(Error::Lifecycle { .. })
    ));
    assert_eq!(rt.state(), Lifecycle::EnvInited);
}

#[test]
fn test_double_init_session_fails() {
    let mut rt = session();
    assert!(rt.init_global_session(SessionConfig::default()).is_err());
    rt.destroy_global_session().unwrap();
    rt.init_global_session(SessionConfig::default()).unwrap();
}

#[test]
fn test_full_teardown_and_reinit() {
    let mut rt = session();
    rt.start_global_session().unwrap();
    assert!(rt.destroy_env().is_err());
    rt.stop_global_session().unwrap();
    rt.destroy_global_session().unwrap();
    rt.destroy_env().unwrap();
    assert!(!rt.is_env_inited());
    rt.init_env(EnvConfig::default()).unwrap();
    assert!(rt.is_env_inited());
}

#[test]
fn test_session_resource_bounded_by_env() {
    let mut rt = Runtime::new();
    rt.init_env(EnvConfig::default().with_cpu_device_num(2)).unwrap();
    let too_big = oxflow::Resource {
        cpu_device_num: 4,
        ..rt.env_resource().unwrap()
    };
    assert!(rt
        .init_global_session(SessionConfig::default().with_resource(too_big))
        .is_err());
    rt.init_global_session(SessionConfig::default()).unwrap();
    assert_eq!(rt.current_resource().unwrap().cpu_device_num, 2);
}

// Contexts

#[test]
fn test_duplicate_open_then_reopen() {
    let mut rt = session();
    rt.open_job("a").unwrap();
    assert!(matches!(rt.open_job("a"), Err(Error::JobNameExist(_))));
    assert!(rt.open_job("b").is_err());
    rt.close_job().unwrap();
    rt.open_job("a").unwrap();
    assert_eq!(rt.current_job_name().unwrap(), "a");
    rt.close_job().unwrap();
    assert!(matches!(rt.current_job_name(), Err(Error::NoOpenJob)));
    assert!(rt.close_job().is_err());
}

#[test]
fn test_job_conf_must_come_first() {
    let mut rt = session();
    rt.open_job("j").unwrap();
    assert!(!rt.has_job_conf().unwrap());
    assert!(rt.add_and_infer_consistent_op(&input_op("x", (2,))).is_err());
    rt.set_job_conf(JobConfig::new("j")).unwrap();
    assert!(rt.has_job_conf().unwrap());
    assert!(rt.set_job_conf(JobConfig::new("j")).is_err());
}

#[test]
fn test_scenario_queries_survive_close() {
    let mut rt = session();
    rt.open_job("j1").unwrap();
    rt.set_job_conf(JobConfig::new("j1")).unwrap();
    let attr = rt.add_and_infer_consistent_op(&input_op("op1", (2, 3))).unwrap();
    assert_eq!(attr.output("out").unwrap().desc.shape, Shape::from((2, 3)));

    assert_eq!(rt.static_shape("j1", "op1/out").unwrap(), Shape::from((2, 3)));
    rt.close_job().unwrap();

    assert_eq!(rt.static_shape("j1", "op1/out").unwrap(), Shape::from((2, 3)));
    assert_eq!(rt.data_type("j1", "op1/out").unwrap().code(), DType::F32.code());
    assert!(matches!(
        rt.blob_attr("j1", "op2/out"),
        Err(Error::BlobNotFound { .. })
    ));
    assert!(matches!(
        rt.blob_attr("nope", "op1/out"),
        Err(Error::JobNotFound(_))
    ));
}

#[test]
fn test_failed_op_leaves_context_open() {
    let mut rt = session();
    rt.open_job("j").unwrap();
    rt.set_job_conf(JobConfig::new("j")).unwrap();
    rt.add_and_infer_consistent_op(&input_op("a", (2, 3))).unwrap();
    rt.add_and_infer_consistent_op(&input_op("b", (3, 2))).unwrap();
    let add = OperatorConf::new(
        "sum",
        OpKind::Binary {
            op: oxflow::BinaryOp::Add,
            lhs: "a/out".into(),
            rhs: "b/out".into(),
        },
    );
    assert!(matches!(
        rt.add_and_infer_consistent_op(&add),
        Err(Error::ShapeMismatch { .. })
    ));
    let dangling = OperatorConf::new(
        "r",
        OpKind::Return {
            input: "missing/out".into(),
        },
    );
    assert!(rt.add_and_infer_consistent_op(&dangling).is_err());
    assert_eq!(rt.current_job_name().unwrap(), "j");
    assert!(rt.op_attribute("j", "sum").is_err());
    rt.check_job().unwrap();
}

#[test]
fn test_loss_and_completion() {
    let mut rt = session();
    rt.open_job("train").unwrap();
    rt.set_job_conf(JobConfig::new("train")).unwrap();
    rt.add_and_infer_consistent_op(&input_op("x", (4, 2))).unwrap();
    let relu = OperatorConf::new(
        "relu",
        OpKind::Unary {
            op: oxflow::UnaryOp::Relu,
            input: "x/out".into(),
        },
    );
    rt.add_and_infer_consistent_op(&relu).unwrap();
    assert!(rt.add_loss_logical_blob_name("nope/out").is_err());
    rt.add_loss_logical_blob_name("relu/out").unwrap();
    rt.complete_job().unwrap();
    assert!(matches!(
        rt.add_and_infer_consistent_op(&input_op("late", (1,))),
        Err(Error::JobCompleted(_))
    ));
    rt.close_job().unwrap();

    let jobs = rt.job_set().unwrap();
    assert_eq!(jobs.jobs.len(), 1);
    assert_eq!(jobs.jobs[0].loss_lbns, vec!["relu/out".to_string()]);
}

#[test]
fn test_mirrored_sub_blobs_are_ordered() {
    let mut rt = Runtime::new();
    rt.init_env(EnvConfig::default().with_cpu_device_num(2)).unwrap();
    rt.init_global_session(SessionConfig::default()).unwrap();
    rt.open_job("m").unwrap();
    let placement = ParallelConf::new("cpu", vec!["0:0-1".into()]);
    rt.set_job_conf(JobConfig::new("m").with_default_parallel_conf(placement))
        .unwrap();
    let mut conf = InterfaceBlobConf::new(Shape::from((2, 3)), DType::F32);
    conf.is_dynamic = true;
    conf.batch_axis = Some(0);
    rt.add_and_infer_mirrored_op(&OperatorConf::input("mx", conf))
        .unwrap();

    assert_eq!(rt.mirrored_blob_num_sub_lbi("m", "mx/out").unwrap(), 2);
    for i in 0..2 {
        let sub = rt.mirrored_blob_sub_lbi("m", "mx/out", i).unwrap();
        assert_eq!(sub.op_name, format!("System-Mirrored-mx-{i}"));
        assert!(rt.blob_attr("m", &sub.lbn()).unwrap().disable_boxing);
    }
    assert!(rt.mirrored_blob_sub_lbi("m", "mx/out", 2).is_err());
    assert!(rt.is_mirrored_blob("m", "mx/out").unwrap());
    assert!(matches!(
        rt.blob_attr("m", "mx/out"),
        Err(Error::IsMirrored { .. })
    ));
    let logical = rt.mirrored_blob_attr("m", "mx/out").unwrap();
    assert_eq!(logical.desc.shape, Shape::from((4, 3)));
    assert_eq!(logical.split_axis, Some(0));
}

#[test]
fn test_diff_watcher_uuid_is_unique() {
    let mut rt = session();
    rt.open_job("j").unwrap();
    rt.set_job_conf(JobConfig::new("j")).unwrap();
    rt.add_and_infer_consistent_op(&input_op("x", (2,))).unwrap();
    let lbi = oxflow::LogicalBlobId::new("x", "out");
    rt.add_lbi_and_diff_watcher_uuid_pair(&lbi, "w1").unwrap();
    assert!(rt.add_lbi_and_diff_watcher_uuid_pair(&lbi, "w1").is_err());
    let missing = oxflow::LogicalBlobId::new("y", "out");
    assert!(rt.add_lbi_and_diff_watcher_uuid_pair(&missing, "w2").is_err());
}

// Ids

#[test]
fn test_logical_object_ids_increase() {
    let rt = session();
    let a = rt.new_logical_object_id().unwrap();
    rt.new_physical_object_id().unwrap();
    let b = rt.new_logical_object_id().unwrap();
    rt.new_physical_object_id().unwrap();
    rt.new_logical_symbol_id().unwrap();
    let c = rt.new_logical_object_id().unwrap();
    assert!(a < b && b < c);
}

#[test]
fn test_ids_survive_session_restart() {
    let mut rt = session();
    let a = rt.new_physical_symbol_id().unwrap();
    rt.destroy_global_session().unwrap();
    rt.init_global_session(SessionConfig::default()).unwrap();
    assert!(rt.new_physical_symbol_id().unwrap() > a);
}
