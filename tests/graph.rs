//! Graph building and planning over whole stacks

use pretty_assertions::assert_eq;
use stackspin::{
    DependencyGraph, ExecutionPlan, Module, ModuleConfig, ModuleOptions, ModuleSet, RunConfig,
    Stack, StackError, YamlConfigProvider,
};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

fn module(path: &str, deps: &[&str]) -> Module {
    let config = ModuleConfig::default().with_dependencies(deps.iter().copied());
    let options =
        ModuleOptions::for_module(Path::new(path), Path::new("/stack"), &RunConfig::default(), &[]);
    Module::new(PathBuf::from(path), config, options)
}

fn p(path: &str) -> PathBuf {
    PathBuf::from(path)
}

fn diamond() -> ModuleSet {
    ModuleSet::from_modules([
        module("/stack/net", &[]),
        module("/stack/dns", &[]),
        module("/stack/db", &["../net"]),
        module("/stack/cache", &["../net"]),
        module("/stack/app", &["../db", "../cache", "../dns"]),
    ])
}

#[test]
fn test_rebuilding_from_resolved_modules_is_stable() {
    let graph = DependencyGraph::build(diamond()).unwrap();
    let rebuilt = DependencyGraph::build(graph.clone().into_module_set()).unwrap();
    assert_eq!(graph, rebuilt);
}

#[test]
fn test_declaration_order_does_not_matter() {
    let reordered = ModuleSet::from_modules([
        module("/stack/app", &["../dns", "../cache", "../db"]),
        module("/stack/cache", &["../net"]),
        module("/stack/db", &["../net"]),
        module("/stack/dns", &[]),
        module("/stack/net", &[]),
    ]);
    assert_eq!(
        DependencyGraph::build(diamond()).unwrap(),
        DependencyGraph::build(reordered).unwrap()
    );
}

#[test]
fn test_every_dependency_runs_in_an_earlier_batch() {
    let graph = DependencyGraph::build(diamond()).unwrap();
    let plan = ExecutionPlan::from_graph(&graph);

    assert_eq!(plan.module_count(), graph.len());
    let index: HashMap<&Path, usize> = plan.batch_indices();
    for module in graph.modules() {
        for dep in &module.dependencies {
            assert!(index[dep.as_path()] < index[module.path.as_path()]);
        }
    }
    assert_eq!(
        plan.batches(),
        &[
            vec![p("/stack/dns"), p("/stack/net")],
            vec![p("/stack/cache"), p("/stack/db")],
            vec![p("/stack/app")],
        ]
    );
}

#[test]
fn test_reverse_plan_runs_dependents_first() {
    let graph = DependencyGraph::build(diamond()).unwrap();
    let reversed = ExecutionPlan::from_graph(&graph).reversed();
    let index = reversed.batch_indices();
    for module in graph.modules() {
        for dep in &module.dependencies {
            assert!(index[dep.as_path()] > index[module.path.as_path()]);
        }
    }
}

#[test]
fn test_net_db_app_batches() {
    let graph = DependencyGraph::build(ModuleSet::from_modules([
        module("/stack/net", &[]),
        module("/stack/db", &["../net"]),
        module("/stack/app", &["../net", "../db"]),
    ]))
    .unwrap();
    let plan = ExecutionPlan::from_graph(&graph);
    assert_eq!(
        plan.batches(),
        &[vec![p("/stack/net")], vec![p("/stack/db")], vec![p("/stack/app")]]
    );
}

#[test]
fn test_cycle_aborts_before_planning() {
    let err = Stack::from_modules(ModuleSet::from_modules([
        module("/stack/a", &["../c"]),
        module("/stack/b", &["../a"]),
        module("/stack/c", &["../b"]),
    ]))
    .unwrap_err();

    assert!(err.is_structural());
    match &err {
        StackError::DependencyCycle { cycle } => {
            assert_eq!(cycle, &[p("/stack/a"), p("/stack/c"), p("/stack/b")]);
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
    assert_eq!(
        err.to_string(),
        "Found a dependency cycle between modules: /stack/a -> /stack/c -> /stack/b -> /stack/a"
    );
}

#[test]
fn test_unrecognized_dependencies_from_several_modules() {
    let err = DependencyGraph::build(ModuleSet::from_modules([
        module("/stack/app", &["../db", "../missing"]),
        module("/stack/db", &["../gone"]),
    ]))
    .unwrap_err();

    match err {
        StackError::Multiple(errors) => {
            assert_eq!(errors.len(), 2);
            assert!(errors
                .iter()
                .all(|e| matches!(e, StackError::UnrecognizedDependency { .. })));
        }
        other => panic!("expected several errors, got {other:?}"),
    }
}

#[test]
fn test_discover_stack_from_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let write = |dir: &str, contents: &str| {
        let module_dir = tmp.path().join(dir);
        fs::create_dir_all(&module_dir).unwrap();
        fs::write(module_dir.join("spin.yaml"), contents).unwrap();
    };
    write("net", "remote_state:\n  backend: s3\n  config:\n    bucket: state\n    key: net.tfstate\n");
    write("db", "dependencies:\n  paths: [\"../net\"]\n");
    write("app", "dependencies:\n  paths: [\"../net\", \"../db\"]\n");
    write(".terraform/cached", "dependencies:\n  paths: [\"../../nowhere\"]\n");

    let stack = Stack::discover(tmp.path(), &RunConfig::default(), &[], &YamlConfigProvider)
        .unwrap();

    let root = tmp.path().to_path_buf();
    let names: Vec<Vec<String>> = stack
        .plan()
        .batches()
        .iter()
        .map(|batch| {
            batch
                .iter()
                .map(|path| {
                    path.strip_prefix(&root)
                        .unwrap_or(path)
                        .display()
                        .to_string()
                })
                .collect()
        })
        .collect();
    assert_eq!(names, vec![vec!["net"], vec!["db"], vec!["app"]]);

    let net = stack
        .graph()
        .modules()
        .find(|m| m.path.ends_with("net"))
        .unwrap();
    assert_eq!(
        net.remote_state_identity().unwrap().lock_key(),
        "s3:bucket=state,key=net.tfstate"
    );
}
