use std::io::Write;

use painter_rs::config::{PainterConfig, RobotBackend};
use painter_rs::trajectory::TrajectorySet;
use painter_rs::PainterError;
use tempfile::NamedTempFile;

fn write_temp(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_load_trajectories_from_file() {
    let file = write_temp(
        r#"{"trajectories": [
            {"color": 1, "points": [[0.01, 0.02], [0.011, 0.021]]},
            {"color": -1, "points": [[0.0, 0.0]]},
            {"color": 2, "points": [[0.05, 0.05], [0.06, 0.05], [0.07, 0.05]]}
        ]}"#,
    );

    let set = TrajectorySet::load(file.path()).unwrap();

    assert_eq!(set.len(), 3);
    let colors: Vec<i64> = set.iter().map(|t| t.color()).collect();
    assert_eq!(colors, vec![1, -1, 2]);
    assert!(set.iter().nth(1).unwrap().is_sentinel());
    assert_eq!(set.iter().nth(2).unwrap().points().len(), 3);
}

#[test]
fn test_bad_trajectory_names_its_index() {
    let file = write_temp(
        r#"{"trajectories": [
            {"color": 1, "points": [[0.0, 0.0]]},
            {"color": 2, "points": []}
        ]}"#,
    );

    match TrajectorySet::load(file.path()) {
        Err(PainterError::MalformedTrajectory { index, .. }) => assert_eq!(index, Some(1)),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_missing_trajectory_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = TrajectorySet::load(dir.path().join("missing.json"));
    assert!(matches!(result, Err(PainterError::Io(_))));
}

#[test]
fn test_load_config_from_file() {
    let file = write_temp(
        r#"{
            "ip": "172.16.0.2",
            "home_position": [0, -45, 0, -135, 0, 90, 45],
            "speed": 0.05,
            "acceleration": 0.2,
            "canvas_tf": [[1,0,0,0.5],[0,1,0,0.0],[0,0,1,0.02],[0,0,0,1]],
            "verbose": true,
            "height_padding": 0.03,
            "robot": "franka"
        }"#,
    );

    let config = PainterConfig::load(file.path()).unwrap();

    assert_eq!(config.ip, "172.16.0.2");
    assert_eq!(config.robot, RobotBackend::Franka);
    assert_eq!(config.home_joints().len(), 7);
    assert!(config.verbose);
    let linear = config.linear_motion();
    assert!(linear.blocking);
    assert_eq!(linear.speed, 0.05);
}

#[test]
fn test_config_with_bad_json() {
    let file = write_temp("{ \"ip\": ");
    assert!(matches!(
        PainterConfig::load(file.path()),
        Err(PainterError::Json(_))
    ));
}
