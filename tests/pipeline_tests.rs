mod common;

use common::{
    dts_with_flash, MemoryStore, MockBuildTool, MockTranslator, PlannedBuild, Workspace,
    MEMORY_LOG,
};
use firmware_sim_runner::{
    aggregate::{results_path, write_results},
    catalog::{BoardCatalog, BoardInfo},
    config::RunConfig,
    core::{ArtifactKind, ArtifactPaths, MemoryUsage, ResultRecord, ResultStatus, Sample},
    environment::ReuseGates,
    error::RunError,
    pipeline::{BoardSelection, Pipeline, BUILD_ARTIFACTS},
    remote::{RemoteIndex, RemoteResult},
};
use std::sync::Arc;

const BOARD: &str = "nrf52dk_nrf52832";

const OVERFLOW_LOG: &str = "\
ld: zephyr/zephyr_pre0.elf section `text' will not fit in region `FLASH'
ld: region `FLASH' overflowed by 200 bytes
collect2: error: ld returned 1 exit status
";

const ENLARGED_MEMORY_LOG: &str = "\
Memory region         Used Size  Region Size  %age Used
           FLASH:       65736 B        65 KB     98.76%
             RAM:        4032 B        64 KB      6.15%
";

fn catalog() -> Arc<BoardCatalog> {
    Arc::new(BoardCatalog::new(vec![
        BoardInfo {
            name: BOARD.to_string(),
            arch: "arm".to_string(),
            path: "boards/arm/nrf52dk_nrf52832".to_string(),
        },
        BoardInfo {
            name: "hifive1".to_string(),
            arch: "riscv".to_string(),
            path: "boards/riscv/hifive1".to_string(),
        },
    ]))
}

fn pipeline(
    config: RunConfig,
    tool: Arc<MockBuildTool>,
    translator: MockTranslator,
    store: Arc<MemoryStore>,
) -> Pipeline {
    Pipeline::new(Arc::new(config), catalog(), tool, Arc::new(translator), store)
}

fn paths(ws: &Workspace, board: &str) -> ArtifactPaths {
    ArtifactPaths::new(&ws.path("artifacts"), board, Sample::HelloWorld)
}

#[tokio::test]
async fn test_successful_build_and_simulation_passes() {
    let ws = Workspace::new();
    let tool = Arc::new(MockBuildTool::new(
        &ws.path("artifacts"),
        vec![PlannedBuild::ok(MEMORY_LOG, Some(dts_with_flash(0x40000)))],
    ));
    let pipeline = pipeline(
        ws.config("echo 'Hello World! nrf52dk_nrf52832' > monitor.txt; exit 0"),
        tool.clone(),
        MockTranslator::cortex_m(Some("uart0")),
        Arc::new(MemoryStore::new()),
    );

    let record = pipeline.run_target(BOARD).await.unwrap();

    assert_eq!(record.status, ResultStatus::Passed);
    assert_eq!(record.board_name, BOARD);
    assert_eq!(record.board_path, "boards/arm/nrf52dk_nrf52832");
    assert_eq!(record.sample_name, "hello_world");
    assert_eq!(record.uart_name, "uart0");
    assert_eq!(record.arch.as_deref(), Some("arm"));
    assert_eq!(record.cpu.as_deref(), Some("nrf52832"));
    assert_eq!(record.board_full_name.as_deref(), Some(""));
    assert_eq!(record.repl_type.as_deref(), Some("AUTO"));
    assert_eq!(
        record.repl_name.as_deref(),
        Some("nrf52dk_nrf52832-hello_world.repl")
    );
    assert_eq!(
        record.memory["FLASH"],
        MemoryUsage {
            used_bytes: 13192,
            capacity_bytes: 256 * 1024
        }
    );
    assert_eq!(record.memory["RAM"].used_bytes, 4032);
    for kind in [
        ArtifactKind::Elf,
        ArtifactKind::Dts,
        ArtifactKind::Config,
        ArtifactKind::ZephyrLog,
        ArtifactKind::Repl,
        ArtifactKind::Resc,
        ArtifactKind::Robot,
        ArtifactKind::Monitor,
    ] {
        assert!(record.files.contains(&kind), "{} not listed", kind);
    }
    assert!(!record.files.contains(&ArtifactKind::Zip));

    let paths = paths(&ws, BOARD);
    assert!(!paths.dts_backup().exists());
    assert!(paths.path(ArtifactKind::Zip).exists());
    assert_eq!(tool.call_count(), 1);
}

#[tokio::test]
async fn test_flash_overflow_is_retried_and_original_capacity_reported() {
    let ws = Workspace::new();
    let tool = Arc::new(MockBuildTool::new(
        &ws.path("artifacts"),
        vec![
            PlannedBuild::failed(OVERFLOW_LOG, Some(dts_with_flash(0x10000))),
            PlannedBuild::ok(ENLARGED_MEMORY_LOG, Some(dts_with_flash(0x10400))),
        ],
    ));
    let pipeline = pipeline(
        ws.config("exit 0"),
        tool.clone(),
        MockTranslator::cortex_m(Some("uart0")),
        Arc::new(MemoryStore::new()),
    );

    let record = pipeline.run_target(BOARD).await.unwrap();

    assert_eq!(record.status, ResultStatus::Passed);
    assert_eq!(record.memory["FLASH"].used_bytes, 65736);
    assert_eq!(record.memory["FLASH"].capacity_bytes, 0x10000);
    assert_eq!(record.memory["RAM"].capacity_bytes, 64 * 1024);

    let calls = tool.calls.lock();
    assert_eq!(calls.len(), 2);
    assert!(calls[1]
        .overlay
        .as_deref()
        .unwrap()
        .contains("reg = <0x0 0x10400>;"));
    assert!(paths(&ws, BOARD).dts_backup().exists());
}

#[tokio::test]
async fn test_failed_build_is_not_built_and_never_simulated() {
    let ws = Workspace::new();
    let tool = Arc::new(MockBuildTool::new(
        &ws.path("artifacts"),
        vec![PlannedBuild::failed("CMake Error: unknown board", None)],
    ));
    let mut config = ws.config("exit 0");
    config.simulator.program = "/nonexistent/renode-test".to_string();
    let pipeline = pipeline(
        config,
        tool,
        MockTranslator::cortex_m(Some("uart0")),
        Arc::new(MemoryStore::new()),
    );

    let record = pipeline.run_target(BOARD).await.unwrap();

    assert_eq!(record.status, ResultStatus::NotBuilt);
    assert!(record.memory.is_empty());
    assert!(record.repl_type.is_none());
    assert_eq!(record.uart_name, "");
    assert_eq!(record.files, vec![ArtifactKind::ZephyrLog]);
}

#[tokio::test]
async fn test_simulation_failure_is_reported_as_built() {
    let ws = Workspace::new();
    let tool = Arc::new(MockBuildTool::new(
        &ws.path("artifacts"),
        vec![PlannedBuild::ok(MEMORY_LOG, Some(dts_with_flash(0x40000)))],
    ));
    let pipeline = pipeline(
        ws.config("exit 1"),
        tool,
        MockTranslator::cortex_m(Some("uart0")),
        Arc::new(MemoryStore::new()),
    );

    let record = pipeline.run_target(BOARD).await.unwrap();

    assert_eq!(record.status, ResultStatus::Built);
    assert_eq!(record.repl_type.as_deref(), Some("AUTO"));
    assert!(!record.memory.is_empty());
}

#[tokio::test]
async fn test_topology_failure_is_a_failed_simulation() {
    let ws = Workspace::new();
    let tool = Arc::new(MockBuildTool::new(
        &ws.path("artifacts"),
        vec![PlannedBuild::ok(MEMORY_LOG, Some(dts_with_flash(0x40000)))],
    ));
    let mut translator = MockTranslator::cortex_m(Some("uart0"));
    translator.fail_topology = true;
    let pipeline = pipeline(
        ws.config("exit 0"),
        tool,
        translator,
        Arc::new(MemoryStore::new()),
    );

    let record = pipeline.run_target(BOARD).await.unwrap();

    assert_eq!(record.status, ResultStatus::Built);
    assert!(record.repl_type.is_none());
}

#[tokio::test]
async fn test_matching_published_result_skips_simulation() {
    let ws = Workspace::new();

    // First run simulates locally and produces the artifacts to publish.
    let first = pipeline(
        ws.config("exit 0"),
        Arc::new(MockBuildTool::new(
            &ws.path("artifacts"),
            vec![PlannedBuild::ok(MEMORY_LOG, Some(dts_with_flash(0x40000)))],
        )),
        MockTranslator::cortex_m(Some("uart0")),
        Arc::new(MemoryStore::new()),
    );
    first.run_target(BOARD).await.unwrap();

    let paths = paths(&ws, BOARD);
    let store = Arc::new(MemoryStore::new());
    for kind in [
        ArtifactKind::Config,
        ArtifactKind::Repl,
        ArtifactKind::Resc,
        ArtifactKind::Robot,
    ] {
        store.publish(&paths, kind);
    }
    store.insert(paths.remote_key(ArtifactKind::Monitor), "published transcript\n");
    let index = RemoteIndex::from_results(vec![RemoteResult {
        board_name: BOARD.to_string(),
        sample_name: "hello_world".to_string(),
        status: ResultStatus::Passed,
        files: vec!["config".into(), "monitor".into(), "repl".into()],
    }]);

    // The simulator cannot be launched, so only reuse lets this pass.
    let mut config = ws.config("exit 0");
    config.simulator.program = "/nonexistent/renode-test".to_string();
    let second = pipeline(
        config,
        Arc::new(MockBuildTool::new(
            &ws.path("artifacts"),
            vec![PlannedBuild::ok(MEMORY_LOG, Some(dts_with_flash(0x40000)))],
        )),
        MockTranslator::cortex_m(Some("uart0")),
        store,
    )
    .with_remote(
        index,
        ReuseGates {
            simulation: true,
            builds: false,
        },
    );

    let record = second.run_target(BOARD).await.unwrap();

    assert_eq!(record.status, ResultStatus::Passed);
    assert_eq!(record.repl_type.as_deref(), Some("AUTO"));
    assert_eq!(
        std::fs::read_to_string(paths.path(ArtifactKind::Monitor)).unwrap(),
        "published transcript\n"
    );
    assert!(!paths.with_suffix(ArtifactKind::Repl, ".remote").exists());
}

#[tokio::test]
async fn test_closed_simulation_gate_ignores_published_results() {
    let ws = Workspace::new();
    let index = RemoteIndex::from_results(vec![RemoteResult {
        board_name: BOARD.to_string(),
        sample_name: "hello_world".to_string(),
        status: ResultStatus::Passed,
        files: Vec::new(),
    }]);
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(
        ws.config("exit 1"),
        Arc::new(MockBuildTool::new(
            &ws.path("artifacts"),
            vec![PlannedBuild::ok(MEMORY_LOG, Some(dts_with_flash(0x40000)))],
        )),
        MockTranslator::cortex_m(Some("uart0")),
        store.clone(),
    )
    .with_remote(index, ReuseGates::default());

    let record = pipeline.run_target(BOARD).await.unwrap();

    assert_eq!(record.status, ResultStatus::Built);
    assert!(store.fetched.lock().is_empty());
}

#[tokio::test]
async fn test_published_build_replaces_local_build() {
    let ws = Workspace::new();
    let paths = paths(&ws, BOARD);
    let store = Arc::new(MemoryStore::new());
    for kind in BUILD_ARTIFACTS {
        let body = match kind {
            ArtifactKind::Dts => dts_with_flash(0x40000),
            ArtifactKind::ZephyrLog => MEMORY_LOG.to_string(),
            ArtifactKind::Config => format!("CONFIG_BOARD=\"{}\"\n", BOARD),
            other => format!("published {}", other),
        };
        store.insert(paths.remote_key(kind), body);
    }
    let tool = Arc::new(MockBuildTool::new(&ws.path("artifacts"), vec![]));
    let pipeline = pipeline(
        ws.config("exit 0"),
        tool.clone(),
        MockTranslator::cortex_m(Some("uart0")),
        store,
    )
    .with_remote(
        RemoteIndex::empty(),
        ReuseGates {
            simulation: false,
            builds: true,
        },
    );

    let record = pipeline.run_target(BOARD).await.unwrap();

    assert_eq!(tool.call_count(), 0);
    assert_eq!(record.status, ResultStatus::Passed);
    assert!(record.files.contains(&ArtifactKind::SbomApp));
    assert_eq!(record.memory["FLASH"].used_bytes, 13192);
}

#[tokio::test]
async fn test_incomplete_published_build_falls_back_to_local_build() {
    let ws = Workspace::new();
    let paths = paths(&ws, BOARD);
    let store = Arc::new(MemoryStore::new());
    store.insert(paths.remote_key(ArtifactKind::Elf), "published elf");
    let tool = Arc::new(MockBuildTool::new(
        &ws.path("artifacts"),
        vec![PlannedBuild::ok(MEMORY_LOG, Some(dts_with_flash(0x40000)))],
    ));
    let pipeline = pipeline(
        ws.config("exit 0"),
        tool.clone(),
        MockTranslator::cortex_m(Some("uart0")),
        store,
    )
    .with_remote(
        RemoteIndex::empty(),
        ReuseGates {
            simulation: false,
            builds: true,
        },
    );

    let record = pipeline.run_target(BOARD).await.unwrap();

    assert_eq!(tool.call_count(), 1);
    assert_eq!(record.status, ResultStatus::Passed);
}

#[tokio::test]
async fn test_partial_published_build_never_counts_as_built() {
    let ws = Workspace::new();
    let paths = paths(&ws, BOARD);
    let store = Arc::new(MemoryStore::new());
    store.insert(paths.remote_key(ArtifactKind::Elf), "published elf");
    let tool = Arc::new(MockBuildTool::new(
        &ws.path("artifacts"),
        vec![PlannedBuild::failed("undefined reference to `main'", None)],
    ));
    let pipeline = pipeline(
        ws.config("exit 0"),
        tool.clone(),
        MockTranslator::cortex_m(Some("uart0")),
        store,
    )
    .with_remote(
        RemoteIndex::empty(),
        ReuseGates {
            simulation: false,
            builds: true,
        },
    );

    let record = pipeline.run_target(BOARD).await.unwrap();

    assert_eq!(tool.call_count(), 1);
    assert_eq!(record.status, ResultStatus::NotBuilt);
    assert!(!paths.path(ArtifactKind::Elf).exists());
    for kind in BUILD_ARTIFACTS {
        assert!(!paths.with_suffix(kind, ".download").exists(), "{} staged", kind);
    }
}

#[tokio::test]
async fn test_parallel_boards_keep_their_own_transcripts() {
    let ws = Workspace::new();
    let mut config = ws.config("echo \"$1\" > monitor.txt; sleep 1; exit 0");
    config.jobs = 2;
    let tool = Arc::new(MockBuildTool::new(
        &ws.path("artifacts"),
        vec![
            PlannedBuild::ok(MEMORY_LOG, Some(dts_with_flash(0x40000))),
            PlannedBuild::ok(MEMORY_LOG, Some(dts_with_flash(0x40000))),
        ],
    ));
    let pipeline = Arc::new(pipeline(
        config,
        tool,
        MockTranslator::cortex_m(Some("uart0")),
        Arc::new(MemoryStore::new()),
    ));

    let records = pipeline
        .run_all(vec![BOARD.to_string(), "hifive1".to_string()])
        .await
        .unwrap();

    assert!(records.iter().all(|r| r.status == ResultStatus::Passed));
    for board in [BOARD, "hifive1"] {
        let monitor =
            std::fs::read_to_string(paths(&ws, board).path(ArtifactKind::Monitor)).unwrap();
        assert!(
            monitor.contains(&format!("{}-hello_world.robot", board)),
            "{} monitor holds {:?}",
            board,
            monitor
        );
    }
}

#[tokio::test]
async fn test_run_all_keeps_board_order_and_writes_results() {
    let ws = Workspace::new();
    let mut config = ws.config("exit 0");
    config.jobs = 2;
    let tool = Arc::new(MockBuildTool::new(
        &ws.path("artifacts"),
        vec![
            PlannedBuild::ok(MEMORY_LOG, Some(dts_with_flash(0x40000))),
            PlannedBuild::ok(MEMORY_LOG, Some(dts_with_flash(0x40000))),
        ],
    ));
    let pipeline = Arc::new(pipeline(
        config.clone(),
        tool,
        MockTranslator::cortex_m(Some("uart0")),
        Arc::new(MemoryStore::new()),
    ));

    let selection = BoardSelection::from_args(vec!["hifive1".into(), BOARD.into()]);
    let boards = selection.resolve(&catalog()).unwrap();
    let records = pipeline.run_all(boards).await.unwrap();

    let names: Vec<&str> = records.iter().map(|r| r.board_name.as_str()).collect();
    assert_eq!(names, vec!["hifive1", BOARD]);
    assert!(records.iter().all(|r| r.status == ResultStatus::Passed));

    let path = results_path(&config.results_dir(), "hello_world", &selection.label());
    assert!(path.ends_with("results/results-hello_world_hifive1_nrf52dk_nrf52832.json"));
    write_results(&path, &records).await.unwrap();
    let written: Vec<ResultRecord> =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(written, records);
    let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(raw[0]["status"], "PASSED");
    assert_eq!(raw[0]["memory"]["FLASH"]["size"], 262144);
}

#[tokio::test]
async fn test_environment_fault_aborts_the_run() {
    let ws = Workspace::new();
    let mut config = ws.config("exit 0");
    config.simulator.program = "/nonexistent/renode-test".to_string();
    let pipeline = Arc::new(pipeline(
        config,
        Arc::new(MockBuildTool::new(
            &ws.path("artifacts"),
            vec![PlannedBuild::ok(MEMORY_LOG, Some(dts_with_flash(0x40000)))],
        )),
        MockTranslator::cortex_m(Some("uart0")),
        Arc::new(MemoryStore::new()),
    ));

    let err = pipeline.run_all(vec![BOARD.to_string()]).await.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<RunError>(),
        Some(RunError::Spawn { .. })
    ));
}
