use crate::{
    config::{check_executable, default_resources, Config, ConfigErrors},
    script::Mode,
};
use std::{fs, os::unix::fs::PermissionsExt, time::Duration};

const EXAMPLE: &str = r#"
executor:
  name: Batch
  n_max_jobs: 8
  work_dir: /scratch/hpo
  poll_interval_ms: 250
  name_prefix: trial
  prologue: module load cuda
  env:
    OMP_NUM_THREADS: "1"
batch:
  submit_command: [qsub, -g, mygroup]
  missing_grace: 5
  mode: gpu
  resources:
    gpu: ["-l", "rt_G.small=1", "-l", "h_rt={walltime}", "-o", "{log}"]
  launchers:
    mpi: [srun, -n, "{n_procs}"]
"#;

#[test]
pub fn parse_full_config() {
    let mut config: Config = serde_yaml::from_str(EXAMPLE).unwrap();

    assert!(!config.preflight_checks());
    assert_eq!(config.executor.name, "batch");
    assert_eq!(config.executor.n_max_jobs(), 8);
    assert_eq!(config.executor.poll_interval(), Duration::from_millis(250));
    assert_eq!(config.executor.env["OMP_NUM_THREADS"], "1");
    assert_eq!(config.batch.submit_command, vec!["qsub", "-g", "mygroup"]);
    assert_eq!(config.batch.status_command, vec!["qstat", "-xml"]);
    assert_eq!(config.batch.index_var, "SGE_TASK_ID");
    assert_eq!(config.batch.mode, Mode::Gpu);
    assert_eq!(config.batch.resources_for(Mode::Gpu)[1], "rt_G.small=1");
    assert_eq!(
        config.batch.resources_for(Mode::Cpu),
        default_resources(Mode::Cpu)
    );
    assert_eq!(
        config.batch.launcher_for(Mode::Mpi).unwrap(),
        &["srun", "-n", "{n_procs}"]
    );
    assert!(config.batch.launcher_for(Mode::Train).is_none());
    assert!(config.batch.directives_for(Mode::Cpu).is_empty());
}

#[test]
pub fn empty_config_uses_defaults() {
    let mut config: Config = serde_yaml::from_str("{}").unwrap();

    assert!(!config.preflight_checks());
    assert_eq!(config.executor.name, "local");
    assert_eq!(config.executor.poll_interval(), Duration::from_secs(1));
    assert!(config.executor.timeout().is_none());
    assert!(config.executor.n_max_jobs() >= 1);
}

#[test]
pub fn unknown_fields_are_rejected() {
    assert!(serde_yaml::from_str::<Config>("executor:\n  threads: 4\n").is_err());
}

#[test]
pub fn preflight_collects_all_errors() {
    let mut config: Config = serde_yaml::from_str(
        "executor:\n  name: slurm\n  n_max_jobs: 0\n  poll_interval_ms: 0\nbatch:\n  mode: cpu-array\n",
    )
    .unwrap();

    assert!(config.preflight_checks());
}

#[test]
pub fn preflight_rejects_missing_job_script() {
    let mut config = Config::default();
    config.executor.job_script = Some("/definitely/not/here.sh".into());

    assert!(config.preflight_checks());
}

#[test]
pub fn executable_check() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("objective.sh");
    fs::write(&script, "#!/bin/sh\n").unwrap();

    fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).unwrap();
    assert!(!check_executable(&script).unwrap());

    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    assert!(check_executable(&script).unwrap());

    assert!(matches!(
        check_executable(&dir.path().join("missing")),
        Err(ConfigErrors::FileNotFound(_))
    ));
}

#[test]
pub fn load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runner.yaml");
    fs::write(&path, EXAMPLE).unwrap();

    assert_eq!(Config::load(&path).unwrap().executor.n_max_jobs, Some(8));
    assert!(matches!(
        Config::load(&dir.path().join("nope.yaml")),
        Err(ConfigErrors::FileNotFound(_))
    ));
}

#[test]
pub fn array_defaults_request_array_range() {
    let flags = default_resources(Mode::CpuArray);
    let position = flags.iter().position(|flag| flag == "-t").unwrap();

    assert_eq!(flags[position + 1], "{array_range}");
}
