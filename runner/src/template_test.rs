use crate::template::{render, shell_quote, Placeholder, Template, TemplateError, Values};

fn values(pairs: &[(Placeholder, &str)]) -> Values {
    pairs
        .iter()
        .map(|(placeholder, value)| (*placeholder, value.to_string()))
        .collect()
}

#[test]
pub fn renders_job_arguments() {
    let values = values(&[
        (Placeholder::JobName, "trial-00003"),
        (Placeholder::JobWorkDir, "/scratch/run"),
    ]);

    assert_eq!(
        render("--out={job.work_dir}/{job.name}.json", &values).unwrap(),
        "--out=/scratch/run/trial-00003.json"
    );
    assert_eq!(render("--lr=0.01", &values).unwrap(), "--lr=0.01");
}

#[test]
pub fn escaped_braces_are_literal() {
    let values = values(&[(Placeholder::IndexVar, "SGE_TASK_ID")]);

    assert_eq!(
        render("slot=${{{index_var}:-1}}", &values).unwrap(),
        "slot=${SGE_TASK_ID:-1}"
    );
}

#[test]
pub fn unknown_placeholder_is_rejected() {
    assert!(matches!(
        Template::parse("--x={job.cwd}"),
        Err(TemplateError::UnknownPlaceholder(name, _)) if name == "job.cwd"
    ));
    assert!(matches!(
        Template::parse("--x={job.name"),
        Err(TemplateError::Unterminated(_))
    ));
    assert!(matches!(
        Template::parse("x}"),
        Err(TemplateError::UnmatchedBrace(_))
    ));
}

#[test]
pub fn missing_value_is_reported() {
    let template = Template::parse("-l h_rt={walltime}").unwrap();

    assert_eq!(
        template.render(&Values::new()),
        Err(TemplateError::MissingValue(Placeholder::Walltime))
    );
    assert_eq!(
        template.placeholders().collect::<Vec<_>>(),
        vec![Placeholder::Walltime]
    );
}

#[test]
pub fn shell_quoting() {
    assert_eq!(shell_quote("--lr=0.1"), "--lr=0.1");
    assert_eq!(shell_quote("a b"), "'a b'");
    assert_eq!(shell_quote(""), "''");
    assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
    assert_eq!(shell_quote("$HOME"), "'$HOME'");
}
