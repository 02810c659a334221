use std::{
    fs,
    time::{Duration, Instant},
};

use memcheck::{
    Config, Controller, Libc, Phase, ReportFormat, ReportMode, Reporter, SizeFilter, Tracer,
};

fn wait_for(tracer: &Tracer<Libc, 1024>, phase: Phase) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while tracer.phase() != phase {
        assert!(Instant::now() < deadline, "still {:?}", tracer.phase());
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn one_shot_window_reports_what_survived() {
    let dir = tempfile::tempdir().unwrap();
    let tracer: &'static Tracer<Libc, 1024> = Box::leak(Box::new(Tracer::new(Libc)));
    let config = Config {
        filter: SizeFilter::new(1024, 8192),
        startup_delay: Duration::ZERO,
        duration: Duration::from_secs(1),
        mode: ReportMode::OneShot,
        format: ReportFormat::Text,
        output_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    let path = Reporter::from_config(&config).path();

    let controller = Controller::new(tracer, config).unwrap().spawn().unwrap();
    wait_for(tracer, Phase::Tracing);

    let tracked = unsafe { tracer.malloc(2048) };
    let untracked = unsafe { tracer.malloc(16) };
    unsafe { tracer.free(tracked) };

    controller.join().unwrap();
    assert_eq!(tracer.phase(), Phase::Stopped);

    let report = fs::read_to_string(path).unwrap();
    let lines: Vec<&str> = report.lines().collect();
    assert_eq!(lines.len(), 2, "{report}");
    let summary = lines[0];
    assert!(
        summary.starts_with("memcheck statistics: malloc:2 calloc:0 realloc:0 free:1 "),
        "{summary}"
    );
    assert!(summary.contains(" outstanding_bytes:0 "), "{summary}");
    assert!(summary.contains(" not_released:0 "), "{summary}");
    assert!(lines[1].starts_with("memcheck statistics: tmp calloc "));

    unsafe { tracer.free(untracked) };
}

#[test]
fn json_lines_report_survivors_of_a_continuous_window() {
    let dir = tempfile::tempdir().unwrap();
    let tracer: &'static Tracer<Libc, 1024> = Box::leak(Box::new(Tracer::new(Libc)));
    let config = Config {
        filter: SizeFilter::new(1024, 8192),
        startup_delay: Duration::ZERO,
        duration: Duration::from_millis(300),
        mode: ReportMode::Continuous,
        max_dumps: Some(1),
        format: ReportFormat::Json,
        output_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    let path = Reporter::from_config(&config).path();

    let controller = Controller::new(tracer, config).unwrap().spawn().unwrap();
    wait_for(tracer, Phase::Tracing);
    let survivor = unsafe { tracer.malloc(4096) };
    controller.join().unwrap();

    let report = fs::read_to_string(path).unwrap();
    let lines: Vec<serde_json::Value> = report
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 2, "{report}");
    assert_eq!(lines[0]["kind"], "record");
    assert_eq!(lines[0]["address"], survivor as usize);
    assert_eq!(lines[0]["dump"], 1);
    assert_eq!(lines[1]["kind"], "summary");
    assert_eq!(lines[1]["not_released"], 1);

    unsafe { tracer.free(survivor) };
}
