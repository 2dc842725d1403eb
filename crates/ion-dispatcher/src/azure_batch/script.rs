//! Renders a [`ModulePod`] as a bash script for a Batch compute node.
//!
//! Batch has no multi-container primitive, so the node runs the pod with
//! docker: one network and one volume per task, init containers in order,
//! then the main containers, waiting for the first of them to exit. An EXIT
//! trap removes everything the script created.

use base64::Engine;
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

use crate::pod::{ContainerSpec, ModulePod};
use crate::Result;

const POD_SCRIPT_TEMPLATE: &str = r#"#!/bin/bash
set -eE
set -o pipefail

cleanup() {
    echo 'Pod exited: removing containers, network and volumes'
    for cidfile in ./*.cid; do
        [ -f "$cidfile" ] || continue
        docker rm -f "$(cat "$cidfile")" > /dev/null 2>&1 || echo "Failed to remove container in $cidfile"
        rm -f "$cidfile"
    done
    docker network rm {{ network | shquote }} > /dev/null 2>&1 || echo 'Failed to remove network'
    docker volume rm -f {{ volume | shquote }} > /dev/null 2>&1 || echo 'Failed to remove volume'
}
trap cleanup EXIT

if ! command -v docker > /dev/null; then
    echo 'Docker not installed... exiting'
    exit 1
fi

{% for registry in registries %}
echo {{ registry.password | shquote }} | docker login --username {{ registry.username | shquote }} --password-stdin {{ registry.server | shquote }}
{% endfor %}
docker network create {{ network | shquote }}
docker volume create {{ volume | shquote }}

{% for c in init_containers %}
{% if pull_always %}
docker pull {{ c.image | shquote }}
{% endif %}
echo 'Running init container {{ c.name }}'
docker run -d --cidfile ./init-{{ loop.index }}.cid --network {{ network | shquote }} -v {{ volume | shquote }}:{{ mount_path | shquote }}{% for flag in c.flags %} {{ flag }}{% endfor %}{% for e in c.env %} -e {{ e | shquote }}{% endfor %} {{ c.image | shquote }}{% for arg in c.args %} {{ arg | shquote }}{% endfor %}

initExitCode=$(docker wait "$(cat ./init-{{ loop.index }}.cid)")
docker logs "$(cat ./init-{{ loop.index }}.cid)" > ./{{ c.name }}.log 2>&1 || true
if [ "$initExitCode" -ne 0 ]; then
    echo "Init container {{ c.name }} exited with code $initExitCode"
    exit "$initExitCode"
fi

{% endfor %}
{% for c in containers %}
{% if pull_always %}
docker pull {{ c.image | shquote }}
{% endif %}
docker run -d --cidfile ./container-{{ loop.index }}.cid --network {{ network | shquote }} -v {{ volume | shquote }}:{{ mount_path | shquote }}{% for flag in c.flags %} {{ flag }}{% endfor %}{% for e in c.env %} -e {{ e | shquote }}{% endfor %} {{ c.image | shquote }}{% for arg in c.args %} {{ arg | shquote }}{% endfor %}

{% endfor %}

echo 'Waiting for any container to exit'
{% for c in containers %}
docker wait "$(cat ./container-{{ loop.index }}.cid)" > /dev/null &
{% endfor %}
wait -n || true

echo 'Checking container exit codes'
overallExitCode=0
{% for c in containers %}
id=$(cat ./container-{{ loop.index }}.cid)
docker logs "$id" > ./{{ c.name }}.log 2>&1 || true
exitCode=$(docker inspect --format '{% raw %}{{.State.ExitCode}}{% endraw %}' "$id")
echo "Container {{ c.name }} exit code: $exitCode"
if [ "$exitCode" -ne 0 ]; then
    overallExitCode=$exitCode
fi
{% endfor %}

exit $overallExitCode
"#;

/// Private registry the node logs in to before pulling images
#[derive(Debug, Clone, Serialize)]
pub struct RegistryCredentials {
    pub server: String,
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
struct ScriptContainer {
    name: String,
    image: String,
    args: Vec<String>,
    /// `NAME=VALUE` pairs
    env: Vec<String>,
    /// Extra `docker run` flags
    flags: Vec<String>,
}

#[derive(Serialize)]
struct ScriptContext<'a> {
    network: &'a str,
    volume: String,
    mount_path: &'a str,
    registries: &'a [RegistryCredentials],
    pull_always: bool,
    init_containers: Vec<ScriptContainer>,
    containers: Vec<ScriptContainer>,
}

/// Inputs for one rendered pod script
pub struct PodScript<'a> {
    /// Names the docker network and volume, so concurrent tasks on a node never share them
    pub task_id: &'a str,
    pub pod: &'a ModulePod,
    pub registries: &'a [RegistryCredentials],
    pub pull_always: bool,
    /// Containers started with `--gpus all`
    pub gpu_containers: &'a [&'a str],
}

fn shquote(value: String) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn script_container(spec: &ContainerSpec, gpu_containers: &[&str]) -> ScriptContainer {
    let flags = if gpu_containers.contains(&spec.name.as_str()) {
        vec!["--gpus".to_string(), "all".to_string()]
    } else {
        Vec::new()
    };

    ScriptContainer {
        name: spec.name.clone(),
        image: spec.image.clone(),
        args: spec.args.clone(),
        env: spec
            .env
            .iter()
            .map(|e| format!("{}={}", e.name, e.value))
            .collect(),
        flags,
    }
}

/// Render the bash script that runs `pod` on a compute node
pub fn render_pod_script(script: &PodScript<'_>) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.add_filter("shquote", shquote);
    env.add_template("pod.sh", POD_SCRIPT_TEMPLATE)?;

    let context = ScriptContext {
        network: script.task_id,
        volume: format!("{}_{}", script.task_id, script.pod.volume_name),
        mount_path: &script.pod.mount_path,
        registries: script.registries,
        pull_always: script.pull_always,
        init_containers: script
            .pod
            .init_containers
            .iter()
            .map(|c| script_container(c, script.gpu_containers))
            .collect(),
        containers: script
            .pod
            .containers
            .iter()
            .map(|c| script_container(c, script.gpu_containers))
            .collect(),
    };

    Ok(env.get_template("pod.sh")?.render(&context)?)
}

/// Task command line running `script`. The script travels base64 encoded so
/// its body needs no quoting.
pub fn command_line(script: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(script);
    format!("/bin/bash -c \"echo {} | base64 -d | /bin/bash\"", encoded)
}
