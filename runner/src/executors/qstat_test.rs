use super::qstat::{parse_job_states, JobEntry, QstatError};

const LISTING: &str = r#"<?xml version='1.0'?>
<job_info  xmlns:xsd="http://arc.liv.ac.uk/repos/darcs/sge/source/dist/util/resources/schemas/qstat/qstat.xsd">
  <queue_info>
    <job_list state="running">
      <JB_job_number>4211</JB_job_number>
      <JAT_prio>0.55500</JAT_prio>
      <JB_name>trial-00001</JB_name>
      <JB_owner>hpo</JB_owner>
      <state>r</state>
      <JAT_start_time>2023-11-02T10:31:07</JAT_start_time>
      <queue_name>all.q@node-17</queue_name>
      <slots>1</slots>
    </job_list>
    <job_list state="running">
      <JB_job_number>4213</JB_job_number>
      <JAT_prio>0.50500</JAT_prio>
      <JB_name>sweep &amp; more</JB_name>
      <JB_owner>hpo</JB_owner>
      <state>r</state>
      <queue_name>all.q@node-03</queue_name>
      <slots>1</slots>
      <tasks>1</tasks>
    </job_list>
  </queue_info>
  <job_info>
    <job_list state="pending">
      <JB_job_number>4213</JB_job_number>
      <JAT_prio>0.50500</JAT_prio>
      <JB_name>sweep &amp; more</JB_name>
      <JB_owner>hpo</JB_owner>
      <state>qw</state>
      <queue_name></queue_name>
      <slots>1</slots>
      <tasks>3-9:2</tasks>
    </job_list>
  </job_info>
</job_info>
"#;

#[test]
pub fn parse_running_and_pending_entries() {
    let entries = parse_job_states(LISTING).unwrap();

    assert_eq!(
        entries,
        vec![
            JobEntry {
                job_id: "4211".to_owned(),
                name: Some("trial-00001".to_owned()),
                state: "r".to_owned(),
                tasks: None,
            },
            JobEntry {
                job_id: "4213".to_owned(),
                name: Some("sweep & more".to_owned()),
                state: "r".to_owned(),
                tasks: Some("1".to_owned()),
            },
            JobEntry {
                job_id: "4213".to_owned(),
                name: Some("sweep & more".to_owned()),
                state: "qw".to_owned(),
                tasks: Some("3-9:2".to_owned()),
            },
        ]
    );
}

#[test]
pub fn empty_listing() {
    let xml = "<?xml version='1.0'?>\n<job_info>\n  <queue_info>\n  </queue_info>\n  <job_info>\n  </job_info>\n</job_info>\n";

    assert!(parse_job_states(xml).unwrap().is_empty());
    assert!(parse_job_states("").unwrap().is_empty());
}

#[test]
pub fn entry_without_state_is_rejected() {
    let xml = "<job_info><job_list><JB_job_number>12</JB_job_number></job_list></job_info>";

    assert!(matches!(
        parse_job_states(xml),
        Err(QstatError::IncompleteEntry("state"))
    ));
}

#[test]
pub fn mismatched_tags_are_rejected() {
    let xml = "<job_info><job_list><state>r</job_list></job_info>";

    assert!(matches!(parse_job_states(xml), Err(QstatError::Xml(_))));
}
