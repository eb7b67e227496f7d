//! Lint scenarios on hand-built modules.

use edgeprep_core::{
    AnyModule, Error, GraphBuilder, Parameter, ParameterStore, ScriptModule, Tensor,
};
use edgeprep_lint::{LintCode, LintFinding, generate_module_lints};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

/// Chain `ops` after a single input, reading `params` at the first operator.
fn module_with(ops: &[&str], params: ParameterStore) -> ScriptModule {
    let mut builder = GraphBuilder::new();
    let mut current = builder.input("x").unwrap();
    for (index, op) in ops.iter().enumerate() {
        let mut inputs = vec![current];
        if index == 0 {
            for name in params.names() {
                inputs.push(builder.param(name).unwrap());
            }
        }
        current = builder.op(op, &inputs).unwrap();
    }
    builder.output(current);
    ScriptModule::new("__torch__.Net", builder.finish(), params)
}

fn with_bundled_inputs(mut module: ScriptModule) -> ScriptModule {
    module
        .attach_bundled_inputs(vec![vec![Tensor::zeros(vec![1, 3])]])
        .unwrap();
    module
}

fn codes(findings: &[LintFinding]) -> Vec<LintCode> {
    findings.iter().map(|finding| finding.code).collect()
}

#[test]
fn test_training_module_findings() {
    init_tracing();
    let mut params = ParameterStore::new();
    params.insert("weight", Parameter::new(Tensor::zeros(vec![3, 3])));
    let module = module_with(&["aten::linear", "aten::dropout"], params);

    let findings = generate_module_lints(&module).unwrap();

    assert_eq!(
        codes(&findings),
        vec![LintCode::BundledInput, LintCode::RequiresGrad, LintCode::Dropout]
    );
    assert!(findings[0].message.starts_with("No bundled input"));
    assert!(findings[1].message.starts_with("Param weight requires grad"));
    assert_eq!(
        findings[2].message,
        "Operator aten::dropout exists, remember to call eval() before saving the module."
    );
}

#[test]
fn test_batch_norm_only() {
    init_tracing();
    let module = with_bundled_inputs(module_with(
        &["aten::batch_norm", "aten::relu"],
        ParameterStore::new(),
    ));

    let findings = generate_module_lints(&module).unwrap();

    assert_eq!(codes(&findings), vec![LintCode::BatchNorm]);
    assert!(findings[0].message.starts_with("Operator aten::batch_norm exists"));
    assert!(findings[0].message.contains("optimize_for_mobile"));
}

#[test]
fn test_clean_module() {
    init_tracing();
    let mut params = ParameterStore::new();
    params.insert("fc.weight", Parameter::frozen(Tensor::zeros(vec![2, 2])));
    let module = with_bundled_inputs(module_with(&["aten::linear", "aten::relu"], params));

    assert!(generate_module_lints(&module).unwrap().is_empty());
}

#[test]
fn test_each_dropout_operator_is_reported() {
    init_tracing();
    let module = with_bundled_inputs(module_with(
        &["aten::feature_dropout", "aten::dropout", "aten::dropout"],
        ParameterStore::new(),
    ));

    let findings = generate_module_lints(&module).unwrap();

    // One finding per distinct operator, in sorted order
    assert_eq!(codes(&findings), vec![LintCode::Dropout, LintCode::Dropout]);
    assert!(findings[0].message.contains("aten::dropout "));
    assert!(findings[1].message.contains("aten::feature_dropout "));
}

#[test]
fn test_dropout_findings_precede_batch_norm() {
    init_tracing();
    let module = with_bundled_inputs(module_with(
        &["aten::batch_norm", "aten::dropout"],
        ParameterStore::new(),
    ));

    let findings = generate_module_lints(&module).unwrap();
    assert_eq!(codes(&findings), vec![LintCode::Dropout, LintCode::BatchNorm]);
}

#[test]
fn test_parameters_in_insertion_order() {
    init_tracing();
    let mut params = ParameterStore::new();
    params.insert("z.weight", Parameter::new(Tensor::zeros(vec![1])));
    params.insert("frozen", Parameter::frozen(Tensor::zeros(vec![1])));
    params.insert("a.weight", Parameter::new(Tensor::zeros(vec![1])));
    let module = with_bundled_inputs(module_with(&["aten::mul"], params));

    let findings = generate_module_lints(&module).unwrap();

    let named: Vec<_> = findings.iter().map(|f| f.message.as_str()).collect();
    assert_eq!(named.len(), 2);
    assert!(named[0].starts_with("Param z.weight "));
    assert!(named[1].starts_with("Param a.weight "));
}

#[test]
fn test_lint_does_not_mutate() {
    init_tracing();
    let mut params = ParameterStore::new();
    params.insert("weight", Parameter::new(Tensor::zeros(vec![3, 3])));
    let module = module_with(&["aten::linear", "aten::dropout"], params);
    let topology = module.graph().topology();

    let first = generate_module_lints(&module).unwrap();
    let second = generate_module_lints(&module).unwrap();

    assert_eq!(first, second);
    assert_eq!(module.graph().topology(), topology);
    assert!(module.is_training());
}

#[test]
fn test_non_module_input() {
    init_tracing();
    let err = generate_module_lints(&AnyModule::other::<u32>()).unwrap_err();
    assert!(matches!(err, Error::Type { got } if got == "u32"));

    let wrapped = AnyModule::from(module_with(&["aten::relu"], ParameterStore::new()));
    assert_eq!(
        codes(&generate_module_lints(&wrapped).unwrap()),
        vec![LintCode::BundledInput]
    );
}

#[test]
fn test_findings_serialize_as_name_and_message() {
    init_tracing();
    let module = module_with(&["aten::dropout"], ParameterStore::new());
    let findings = generate_module_lints(&module).unwrap();

    let json = serde_json::to_value(&findings).unwrap();
    assert_eq!(json[0]["name"], "BUNDLED_INPUT");
    assert_eq!(json[1]["name"], "DROPOUT");
    assert_eq!(
        json[1]["message"],
        "Operator aten::dropout exists, remember to call eval() before saving the module."
    );
    assert_eq!(json[1].as_object().map(|fields| fields.len()), Some(2));

    let batch_norm = serde_json::to_string(&LintCode::BatchNorm).unwrap();
    assert_eq!(batch_norm, "\"BATCHNORM\"");
}
