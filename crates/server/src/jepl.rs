//! JePL artifact renderer
//!
//! Transforms a pipeline request into the concrete file set consumed by the
//! CI engine: build-configuration documents, the container-composition
//! document, auxiliary command scripts and the Jenkinsfile. Pure except for
//! the random tokens in secondary file names, which are drawn from a
//! caller-supplied rng so tests can seed them.

use rand::Rng;
use serde_json::{json, Map, Value};
use url::Url;

use sqaaas_common::error::{Error, Result};
use sqaaas_common::types::{Artifacts, CommandsScript, ComposerFile, ConfigFile, PipelineRequest};

/// Primary build-configuration file path (part of the external contract)
pub const CONFIG_FILE: &str = ".sqa/config.yml";
/// Container-composition file path
pub const COMPOSER_FILE: &str = ".sqa/docker-compose.yml";
/// Job script file path
pub const JENKINSFILE: &str = "Jenkinsfile";

/// Directory bind-mounted into every service when no volumes are declared
const DEFAULT_BUILD_DIR: &str = "/sqaaas-build";

/// Pipeline library the rendered Jenkinsfile pins
const JPL_LIBRARY: &str = "github.com/indigo-dc/jenkins-pipeline-library@v2.1.0";

const TOKEN_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const TOKEN_LEN: usize = 6;

/// Render the full artifact set for a request.
///
/// Only the first build-configuration document of the request is honored;
/// the remaining entries are parsed but ignored.
pub fn render<R: Rng>(request: &PipelineRequest, rng: &mut R) -> Result<Artifacts> {
    let mut config = request
        .config_data
        .first()
        .cloned()
        .unwrap_or_else(|| json!({}));
    if !config.is_object() {
        return Err(Error::Validation(
            "build-configuration document must be a JSON object".to_string(),
        ));
    }
    let mut composer = request.composer_data.clone();

    let registry_env = normalize_composer(&mut composer)?;
    merge_environment(&mut config, registry_env);

    let url_to_key = rewrite_project_repos(&mut config);

    let mut commands_scripts = Vec::new();
    let when_criteria = rewrite_criteria(&mut config, &url_to_key, &mut commands_scripts, rng)?;

    // Shared document first, then one guarded document per when-criterion
    let mut configs = vec![ConfigFile {
        data_yml: to_yaml(&config)?,
        data_json: config.clone(),
        data_when: None,
        file_name: CONFIG_FILE.to_string(),
    }];
    for (key, criterion, when) in when_criteria {
        let mut doc = config.clone();
        doc["sqa_criteria"] = json!({ key: criterion });
        configs.push(ConfigFile {
            data_yml: to_yaml(&doc)?,
            data_json: doc,
            data_when: Some(when),
            file_name: format!(".sqa/config.{}.yml", random_token(rng)),
        });
    }

    let jenkinsfile = render_jenkinsfile(&configs);

    Ok(Artifacts {
        composer: ComposerFile {
            data_yml: to_yaml(&composer)?,
            data_json: composer,
            file_name: COMPOSER_FILE.to_string(),
        },
        config: configs,
        jenkinsfile,
        commands_scripts,
    })
}

fn to_yaml(value: &Value) -> Result<String> {
    serde_yaml::to_string(value).map_err(|e| Error::Validation(format!("cannot serialize to YAML: {}", e)))
}

fn random_token<R: Rng>(rng: &mut R) -> String {
    (0..TOKEN_LEN)
        .map(|_| TOKEN_CHARS[rng.gen_range(0..TOKEN_CHARS.len())] as char)
        .collect()
}

// ============================================================================
// Composer normalization
// ============================================================================

/// Normalize every service of the composition.
///
/// Returns the environment variables derived from registry sub-objects
/// (`JPL_DOCKERPUSH`, `JPL_DOCKERSERVER`), which belong on the build config.
fn normalize_composer(composer: &mut Value) -> Result<Vec<(String, String)>> {
    let mut push_services: Vec<String> = Vec::new();
    let mut docker_server: Option<String> = None;

    let services = match composer.get_mut("services").and_then(Value::as_object_mut) {
        Some(s) => s,
        None => return Ok(Vec::new()),
    };

    for (service_name, service) in services.iter_mut() {
        // Registry sub-object translates into build-config environment
        if let Some(registry) = service
            .get_mut("image")
            .and_then(Value::as_object_mut)
            .and_then(|image| image.remove("registry"))
        {
            let push = registry.get("push").and_then(Value::as_bool).unwrap_or(false);
            if push {
                let credential_id = registry
                    .get("credential_id")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if credential_id.is_empty() {
                    return Err(Error::Validation(format!(
                        "service <{}> requests a registry push but no credential_id was provided",
                        service_name
                    )));
                }
                if !push_services.iter().any(|s| s == service_name) {
                    push_services.push(service_name.clone());
                }
            }
            // Last registry wins
            if let Some(url) = registry.get("url").and_then(Value::as_str) {
                docker_server = Some(url.to_string());
            }
        }

        // Collapse image to its name string
        if let Some(name) = service
            .get("image")
            .and_then(Value::as_object)
            .and_then(|image| image.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string)
        {
            service["image"] = Value::String(name);
        }

        // Default bind volume when none is declared
        if service.get("volumes").is_none() {
            service["volumes"] = json!([{
                "type": "bind",
                "source": "./",
                "target": DEFAULT_BUILD_DIR,
            }]);
        }

        // Working directory follows the first volume target
        if let Some(target) = service
            .get("volumes")
            .and_then(Value::as_array)
            .and_then(|v| v.first())
            .and_then(|v| v.get("target"))
            .and_then(Value::as_str)
            .map(str::to_string)
        {
            service["working_dir"] = Value::String(target);
        }

        prune_empty(service);
    }

    let mut env = Vec::new();
    if !push_services.is_empty() {
        env.push(("JPL_DOCKERPUSH".to_string(), push_services.join(" ")));
    }
    if let Some(server) = docker_server {
        env.push(("JPL_DOCKERSERVER".to_string(), server));
    }
    Ok(env)
}

/// Remove properties whose value is an empty container or empty string,
/// recursing bottom-up so containers emptied by pruning are removed too.
fn prune_empty(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for v in map.values_mut() {
                prune_empty(v);
            }
            map.retain(|_, v| !is_empty_value(v));
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                prune_empty(v);
            }
        }
        _ => {}
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::String(s) => s.is_empty(),
        Value::Object(m) => m.is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

// ============================================================================
// Project-repo keying
// ============================================================================

/// Stable key for a repository URL: network location plus path.
///
/// `https://git.example/x/y` -> `git.example/x/y`
fn repo_key(repo_url: &str) -> Option<String> {
    let parsed = Url::parse(repo_url).ok()?;
    let host = parsed.host_str()?;
    let path = parsed.path().trim_end_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);
    Some(format!("{}{}", host, path))
}

/// Rewrite `config.project_repos` from a sequence into a keyed mapping.
///
/// Returns the auxiliary URL -> key map used for criteria resolution.
fn rewrite_project_repos(config: &mut Value) -> Vec<(String, String)> {
    let mut url_to_key = Vec::new();

    let entries = match config
        .get_mut("config")
        .and_then(|c| c.get_mut("project_repos"))
    {
        Some(p) => p,
        None => return url_to_key,
    };
    let list = match entries.as_array() {
        Some(l) => l.clone(),
        None => return url_to_key,
    };

    let mut keyed = Map::new();
    for entry in list {
        let repo_url = match entry.get("repo").and_then(Value::as_str) {
            Some(u) => u.to_string(),
            None => continue,
        };
        let key = match repo_key(&repo_url) {
            Some(k) => k,
            None => continue,
        };
        let mut remainder = entry.as_object().cloned().unwrap_or_default();
        remainder.remove("repo");
        keyed.insert(key.clone(), Value::Object(remainder));
        url_to_key.push((repo_url, key));
    }
    *entries = Value::Object(keyed);

    url_to_key
}

fn lookup_key<'a>(url_to_key: &'a [(String, String)], repo_url: &str) -> Option<&'a str> {
    url_to_key
        .iter()
        .find(|(url, _)| url == repo_url)
        .map(|(_, key)| key.as_str())
}

// ============================================================================
// Criteria rewriting
// ============================================================================

type WhenCriterion = (String, Value, Value);

/// Rewrite every criterion in `sqa_criteria`.
///
/// Repo sequences become keyed mappings, raw command lists become auxiliary
/// shell scripts, and criteria carrying a `when` predicate are popped out so
/// the caller can emit them as separate guarded documents.
fn rewrite_criteria<R: Rng>(
    config: &mut Value,
    url_to_key: &[(String, String)],
    commands_scripts: &mut Vec<CommandsScript>,
    rng: &mut R,
) -> Result<Vec<WhenCriterion>> {
    let mut when_criteria = Vec::new();

    let criteria = match config.get_mut("sqa_criteria").and_then(Value::as_object_mut) {
        Some(c) => c,
        None => return Ok(when_criteria),
    };

    for (criterion_key, criterion) in criteria.iter_mut() {
        let repo_entries = criterion.get("repos").and_then(Value::as_array).cloned();
        if let Some(repo_entries) = repo_entries {
            let mut keyed = Map::new();
            for entry in repo_entries {
                let mut remainder = entry.as_object().cloned().unwrap_or_default();
                let repo_url = remainder
                    .remove("repo_url")
                    .and_then(|v| v.as_str().map(str::to_string));
                let key = repo_url
                    .as_deref()
                    .and_then(|url| lookup_key(url_to_key, url))
                    .map(str::to_string)
                    .or_else(|| repo_url.as_deref().and_then(repo_key))
                    .unwrap_or_else(|| "this_repo".to_string());

                let commands = remainder.get("commands").and_then(Value::as_array).cloned();
                if let Some(commands) = commands {
                    if !commands.is_empty() {
                        let script = render_commands_script(&key, &commands)?;
                        let file_name = format!(".sqa/script.{}.sh", random_token(rng));
                        remainder.insert(
                            "commands".to_string(),
                            json!([format!("bash {}", file_name)]),
                        );
                        commands_scripts.push(CommandsScript {
                            data: script,
                            file_name,
                        });
                    }
                }

                keyed.insert(key, Value::Object(remainder));
            }
            criterion["repos"] = Value::Object(keyed);
        }

        if let Some(when) = criterion.as_object_mut().and_then(|c| c.remove("when")) {
            when_criteria.push((criterion_key.clone(), criterion.clone(), when));
        }
    }

    // Guarded criteria leave the shared document
    for (key, _, _) in &when_criteria {
        criteria.remove(key);
    }

    Ok(when_criteria)
}

/// Shell script wrapping a criterion's raw commands.
///
/// The script changes into the checked-out repository directory and chains
/// the commands so the stage fails on the first broken one.
fn render_commands_script(repo_dir: &str, commands: &[Value]) -> Result<String> {
    let mut parts = Vec::with_capacity(commands.len() + 1);
    let cd_dir = if repo_dir == "this_repo" { "." } else { repo_dir };
    parts.push(format!("cd {}", cd_dir));
    for command in commands {
        let command = command
            .as_str()
            .ok_or_else(|| Error::Validation("criterion commands must be strings".to_string()))?;
        parts.push(command.to_string());
    }
    Ok(format!("#!/bin/bash\n{}\n", parts.join(" && ")))
}

fn merge_environment(config: &mut Value, additions: Vec<(String, String)>) {
    if additions.is_empty() {
        return;
    }
    if config.get("environment").and_then(Value::as_object).is_none() {
        config["environment"] = json!({});
    }
    let Some(env) = config["environment"].as_object_mut() else {
        return;
    };
    for (key, value) in additions {
        if key == "JPL_DOCKERPUSH" {
            // Append-dedup on the space-separated service list
            let mut services: Vec<String> = env
                .get(&key)
                .and_then(Value::as_str)
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default();
            for service in value.split_whitespace() {
                if !services.iter().any(|s| s == service) {
                    services.push(service.to_string());
                }
            }
            env.insert(key, Value::String(services.join(" ")));
        } else {
            env.insert(key, Value::String(value));
        }
    }
}

// ============================================================================
// Jenkinsfile rendering
// ============================================================================

/// Branch names a `when` predicate guards on.
///
/// Supports `{branch: "x"}`, `{branch: {pattern: "x"}}` and
/// `{branches: ["x", "y"]}`; anything else yields no guard.
fn when_branches(when: &Value) -> Vec<String> {
    if let Some(branch) = when.get("branch") {
        if let Some(name) = branch.as_str() {
            return vec![name.to_string()];
        }
        if let Some(pattern) = branch.get("pattern").and_then(Value::as_str) {
            return vec![pattern.to_string()];
        }
    }
    if let Some(branches) = when.get("branches").and_then(Value::as_array) {
        return branches
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
    }
    Vec::new()
}

/// Render the declarative job script for the full list of config documents.
///
/// Documents with a branch-filter predicate get a guarded stage; the shared
/// document gets an unguarded one.
pub fn render_jenkinsfile(configs: &[ConfigFile]) -> String {
    let mut stages = String::new();
    for config in configs {
        let guard = match &config.data_when {
            Some(when) => {
                let branches = when_branches(when);
                match branches.len() {
                    0 => String::new(),
                    1 => format!(
                        "            when {{\n                branch '{}'\n            }}\n",
                        branches[0]
                    ),
                    _ => {
                        let alternatives = branches
                            .iter()
                            .map(|b| format!("                    branch '{}'", b))
                            .collect::<Vec<_>>()
                            .join("\n");
                        format!(
                            "            when {{\n                anyOf {{\n{}\n                }}\n            }}\n",
                            alternatives
                        )
                    }
                }
            }
            None => String::new(),
        };
        stages.push_str(&format!(
            r#"        stage('SQA baseline dynamic stages: {file}') {{
{guard}            steps {{
                script {{
                    projectConfig = pipelineConfig(configFile: '{file}')
                    buildStages(projectConfig)
                }}
            }}
            post {{
                cleanup {{
                    cleanWs()
                }}
            }}
        }}
"#,
            file = config.file_name,
            guard = guard,
        ));
    }

    format!(
        r#"@Library(['{library}']) _

def projectConfig

pipeline {{
    agent any

    stages {{
{stages}    }}
}}
"#,
        library = JPL_LIBRARY,
        stages = stages,
    )
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn request(config: Value, composer: Value) -> PipelineRequest {
        PipelineRequest {
            name: "demo".to_string(),
            config_data: vec![config],
            composer_data: composer,
            jenkinsfile_data: json!({}),
        }
    }

    fn simple_composer() -> Value {
        json!({"services": {"checker": {"image": {"name": "foo:1"}}}})
    }

    #[test]
    fn test_commands_become_script() {
        let config = json!({
            "config": {
                "project_repos": [
                    {"repo": "https://git.example/x/y", "branch": "main"}
                ]
            },
            "sqa_criteria": {
                "QC.Sty": {
                    "repos": [
                        {"repo_url": "https://git.example/x/y", "commands": ["make lint"]}
                    ]
                }
            }
        });
        let mut rng = StdRng::seed_from_u64(1);
        let artifacts = render(&request(config, simple_composer()), &mut rng).unwrap();

        assert_eq!(artifacts.commands_scripts.len(), 1);
        let script = &artifacts.commands_scripts[0];
        assert!(script.data.contains("cd git.example/x/y && make lint"));
        assert!(script.data.starts_with("#!/bin/bash"));
        assert!(script.file_name.starts_with(".sqa/script."));
        assert!(script.file_name.ends_with(".sh"));

        // Criterion now invokes the script by path
        let repos = &artifacts.config[0].data_json["sqa_criteria"]["QC.Sty"]["repos"];
        let entry = &repos["git.example/x/y"];
        assert_eq!(
            entry["commands"],
            json!([format!("bash {}", script.file_name)])
        );
    }

    #[test]
    fn test_missing_repo_url_resolves_to_this_repo() {
        let config = json!({
            "sqa_criteria": {
                "QC.Uni": {"repos": [{"commands": ["make test"]}]}
            }
        });
        let mut rng = StdRng::seed_from_u64(2);
        let artifacts = render(&request(config, simple_composer()), &mut rng).unwrap();

        let repos = &artifacts.config[0].data_json["sqa_criteria"]["QC.Uni"]["repos"];
        assert!(repos.get("this_repo").is_some());
        assert!(artifacts.commands_scripts[0].data.contains("cd . && make test"));
    }

    #[test]
    fn test_project_repos_keyed_by_netloc_and_path() {
        let config = json!({
            "config": {
                "project_repos": [
                    {"repo": "https://github.com/org/tool.git", "branch": "main"}
                ]
            }
        });
        let mut rng = StdRng::seed_from_u64(3);
        let artifacts = render(&request(config, simple_composer()), &mut rng).unwrap();

        let repos = &artifacts.config[0].data_json["config"]["project_repos"];
        let entry = &repos["github.com/org/tool"];
        assert_eq!(entry["branch"], json!("main"));
        assert!(entry.get("repo").is_none());
    }

    #[test]
    fn test_when_criterion_splits_into_guarded_document() {
        let config = json!({
            "sqa_criteria": {
                "QC.Sty": {"repos": [{"commands": ["make lint"]}]},
                "QC.Del": {
                    "repos": [{"commands": ["make deploy"]}],
                    "when": {"branch": "production"}
                }
            }
        });
        let mut rng = StdRng::seed_from_u64(4);
        let artifacts = render(&request(config, simple_composer()), &mut rng).unwrap();

        assert_eq!(artifacts.config.len(), 2);
        let shared = &artifacts.config[0];
        assert_eq!(shared.file_name, CONFIG_FILE);
        assert!(shared.data_when.is_none());
        assert!(shared.data_json["sqa_criteria"].get("QC.Del").is_none());
        assert!(shared.data_json["sqa_criteria"].get("QC.Sty").is_some());

        let guarded = &artifacts.config[1];
        assert!(guarded.file_name.starts_with(".sqa/config."));
        assert!(guarded.file_name.ends_with(".yml"));
        assert_ne!(guarded.file_name, CONFIG_FILE);
        assert_eq!(guarded.data_when, Some(json!({"branch": "production"})));
        assert!(guarded.data_json["sqa_criteria"].get("QC.Del").is_some());
        assert!(guarded.data_json["sqa_criteria"].get("QC.Sty").is_none());
        // The popped predicate does not leak into the document body
        assert!(guarded.data_json["sqa_criteria"]["QC.Del"].get("when").is_none());
    }

    #[test]
    fn test_registry_push_sets_environment() {
        let composer = json!({
            "services": {
                "worker": {
                    "image": {
                        "name": "org/worker:2",
                        "registry": {
                            "url": "https://hub.docker.com",
                            "push": true,
                            "credential_id": "docker-creds"
                        }
                    }
                }
            }
        });
        let mut rng = StdRng::seed_from_u64(5);
        let artifacts = render(&request(json!({}), composer), &mut rng).unwrap();

        let env = &artifacts.config[0].data_json["environment"];
        assert_eq!(env["JPL_DOCKERPUSH"], json!("worker"));
        assert_eq!(env["JPL_DOCKERSERVER"], json!("https://hub.docker.com"));

        // Image collapsed to its name, registry gone
        let service = &artifacts.composer.data_json["services"]["worker"];
        assert_eq!(service["image"], json!("org/worker:2"));
    }

    #[test]
    fn test_registry_push_without_credentials_fails() {
        let composer = json!({
            "services": {
                "worker": {
                    "image": {
                        "name": "org/worker:2",
                        "registry": {"url": "https://hub.docker.com", "push": true, "credential_id": ""}
                    }
                }
            }
        });
        let mut rng = StdRng::seed_from_u64(6);
        let err = render(&request(json!({}), composer), &mut rng).unwrap_err();
        assert_eq!(err.http_status(), 400);
        assert!(err.to_string().contains("credential_id"));
    }

    #[test]
    fn test_default_volume_and_working_dir() {
        let mut rng = StdRng::seed_from_u64(7);
        let artifacts = render(&request(json!({}), simple_composer()), &mut rng).unwrap();

        let service = &artifacts.composer.data_json["services"]["checker"];
        assert_eq!(
            service["volumes"],
            json!([{"type": "bind", "source": "./", "target": "/sqaaas-build"}])
        );
        assert_eq!(service["working_dir"], json!("/sqaaas-build"));
    }

    #[test]
    fn test_declared_volume_drives_working_dir() {
        let composer = json!({
            "services": {
                "checker": {
                    "image": {"name": "foo:1"},
                    "volumes": [{"type": "bind", "source": "./", "target": "/work"}]
                }
            }
        });
        let mut rng = StdRng::seed_from_u64(8);
        let artifacts = render(&request(json!({}), composer), &mut rng).unwrap();
        let service = &artifacts.composer.data_json["services"]["checker"];
        assert_eq!(service["working_dir"], json!("/work"));
    }

    #[test]
    fn test_empty_properties_pruned() {
        let composer = json!({
            "services": {
                "checker": {
                    "image": {"name": "foo:1"},
                    "hostname": "",
                    "environment": {},
                    "command": []
                }
            }
        });
        let mut rng = StdRng::seed_from_u64(9);
        let artifacts = render(&request(json!({}), composer), &mut rng).unwrap();
        let service = &artifacts.composer.data_json["services"]["checker"];
        assert!(service.get("hostname").is_none());
        assert!(service.get("environment").is_none());
        assert!(service.get("command").is_none());
    }

    #[test]
    fn test_render_is_deterministic_for_a_seed() {
        let config = json!({
            "sqa_criteria": {
                "QC.Sty": {"repos": [{"commands": ["make lint"]}]},
                "QC.Del": {"repos": [{"commands": ["x"]}], "when": {"branch": "main"}}
            }
        });
        let req = request(config, simple_composer());

        let a = render(&req, &mut StdRng::seed_from_u64(42)).unwrap();
        let b = render(&req, &mut StdRng::seed_from_u64(42)).unwrap();
        assert_eq!(a, b);

        let c = render(&req, &mut StdRng::seed_from_u64(43)).unwrap();
        // Only the random tokens may differ
        assert_ne!(a.config[1].file_name, c.config[1].file_name);
        assert_eq!(a.config[0].data_yml, c.config[0].data_yml);
    }

    #[test]
    fn test_file_names_unique() {
        let config = json!({
            "sqa_criteria": {
                "QC.A": {"repos": [{"commands": ["a"]}], "when": {"branch": "x"}},
                "QC.B": {"repos": [{"commands": ["b"]}], "when": {"branch": "y"}},
                "QC.C": {"repos": [{"commands": ["c"]}]}
            }
        });
        let mut rng = StdRng::seed_from_u64(10);
        let artifacts = render(&request(config, simple_composer()), &mut rng).unwrap();

        let mut names: Vec<&str> = artifacts
            .config
            .iter()
            .map(|c| c.file_name.as_str())
            .chain(artifacts.commands_scripts.iter().map(|s| s.file_name.as_str()))
            .collect();
        names.push(&artifacts.composer.file_name);
        names.push(JENKINSFILE);

        let mut deduped = names.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(names.len(), deduped.len());
    }

    #[test]
    fn test_jenkinsfile_guarded_and_unguarded_stages() {
        let config = json!({
            "sqa_criteria": {
                "QC.Sty": {"repos": [{"commands": ["make lint"]}]},
                "QC.Del": {"repos": [{"commands": ["x"]}], "when": {"branch": "release/1.0"}}
            }
        });
        let mut rng = StdRng::seed_from_u64(11);
        let artifacts = render(&request(config, simple_composer()), &mut rng).unwrap();

        let jenkinsfile = &artifacts.jenkinsfile;
        assert!(jenkinsfile.contains("@Library"));
        assert!(jenkinsfile.contains("configFile: '.sqa/config.yml'"));
        assert!(jenkinsfile.contains(&format!(
            "configFile: '{}'",
            artifacts.config[1].file_name
        )));
        assert!(jenkinsfile.contains("branch 'release/1.0'"));
        // Exactly one guarded stage
        assert_eq!(jenkinsfile.matches("when {").count(), 1);
    }

    #[test]
    fn test_when_branch_pattern_and_list_forms() {
        assert_eq!(when_branches(&json!({"branch": "main"})), vec!["main"]);
        assert_eq!(
            when_branches(&json!({"branch": {"pattern": "release/*"}})),
            vec!["release/*"]
        );
        assert_eq!(
            when_branches(&json!({"branches": ["a", "b"]})),
            vec!["a", "b"]
        );
        assert!(when_branches(&json!({"tag": "v1"})).is_empty());
    }

    #[test]
    fn test_dockerpush_append_dedup() {
        let mut config = json!({"environment": {"JPL_DOCKERPUSH": "worker"}});
        merge_environment(
            &mut config,
            vec![("JPL_DOCKERPUSH".to_string(), "worker builder".to_string())],
        );
        assert_eq!(config["environment"]["JPL_DOCKERPUSH"], json!("worker builder"));
    }
}
