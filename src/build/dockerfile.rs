//! Container recipe synthesis for sources shipped without a Dockerfile.
//!
//! Every generated image downloads the of-watchdog for the build machine's
//! CPU architecture, wires the manifest command in as `fprocess`, and runs
//! the watchdog in streaming mode on port 8080.

use std::path::Path;

use super::manifest::Manifest;
use crate::error::{GatewayError, Result};

const WATCHDOG_VERSION: &str = "0.11.0";

pub fn generate_dockerfile(manifest: &Manifest, context_dir: &Path) -> Result<String> {
    let runtime = manifest.runtime.to_lowercase();
    if runtime.is_empty() {
        return Err(GatewayError::bad_request(
            "runtime is required in docker-faas.yaml",
        ));
    }

    match runtime.as_str() {
        "python" => Ok(python_dockerfile(manifest, context_dir)),
        "node" => Ok(node_dockerfile(manifest, context_dir)),
        "go" => Ok(go_dockerfile(manifest)),
        "bash" => Ok(bash_dockerfile(manifest)),
        other => Err(GatewayError::bad_request(format!(
            "unsupported runtime: {other}"
        ))),
    }
}

fn watchdog_install() -> String {
    format!(
        r#"RUN ARCH="$(uname -m)" && \
  case "$ARCH" in \
    x86_64|amd64) WATCHDOG="fwatchdog-amd64" ;; \
    aarch64|arm64) WATCHDOG="fwatchdog-arm64" ;; \
    armv7l|armv7|armhf) WATCHDOG="fwatchdog-arm" ;; \
    *) echo "Unsupported arch: $ARCH" >&2; exit 1 ;; \
  esac && \
  curl -sSL -o /usr/local/bin/fwatchdog "https://github.com/openfaas/of-watchdog/releases/download/{WATCHDOG_VERSION}/${{WATCHDOG}}" && \
  chmod +x /usr/local/bin/fwatchdog"#
    )
}

fn watchdog_entrypoint(command: &str) -> String {
    format!(
        r#"ENV fprocess="{command}"
ENV mode="streaming"

EXPOSE 8080
CMD ["fwatchdog"]"#
    )
}

fn python_dockerfile(manifest: &Manifest, context_dir: &Path) -> String {
    let install_deps = if has_file(context_dir, "requirements.txt")
        || includes_dependency(&manifest.dependencies, "requirements.txt")
    {
        "RUN pip install --no-cache-dir -r requirements.txt\n"
    } else {
        ""
    };

    format!(
        r#"FROM python:3.11-slim

WORKDIR /home/app
COPY . .
{install_deps}
RUN apt-get update && apt-get install -y curl ca-certificates && rm -rf /var/lib/apt/lists/*
{watchdog}

{entrypoint}
"#,
        watchdog = watchdog_install(),
        entrypoint = watchdog_entrypoint(&manifest.command),
    )
}

fn node_dockerfile(manifest: &Manifest, context_dir: &Path) -> String {
    let install_cmd = if has_file(context_dir, "package-lock.json") {
        "RUN npm ci\n"
    } else if has_file(context_dir, "package.json")
        || includes_dependency(&manifest.dependencies, "package.json")
    {
        "RUN npm install\n"
    } else {
        ""
    };

    format!(
        r#"FROM node:20-slim

WORKDIR /home/app
COPY . .
{install_cmd}
RUN apt-get update && apt-get install -y curl ca-certificates && rm -rf /var/lib/apt/lists/*
{watchdog}

{entrypoint}
"#,
        watchdog = watchdog_install(),
        entrypoint = watchdog_entrypoint(&manifest.command),
    )
}

fn go_dockerfile(manifest: &Manifest) -> String {
    let build_steps = if manifest.build.is_empty() {
        vec![
            "go mod download".to_string(),
            "go build -o app ./".to_string(),
        ]
    } else {
        manifest.build.clone()
    };

    let build_lines: String = build_steps
        .iter()
        .map(|step| format!("RUN {step}\n"))
        .collect();

    format!(
        r#"FROM golang:1.22 AS builder

WORKDIR /src
COPY . .
{build_lines}
FROM debian:bookworm-slim
WORKDIR /home/app
RUN apt-get update && apt-get install -y curl ca-certificates && rm -rf /var/lib/apt/lists/*
{watchdog}

COPY --from=builder /src /home/app

{entrypoint}
"#,
        watchdog = watchdog_install(),
        entrypoint = watchdog_entrypoint(&manifest.command),
    )
}

fn bash_dockerfile(manifest: &Manifest) -> String {
    format!(
        r#"FROM debian:bookworm-slim

WORKDIR /home/app
COPY . .
RUN apt-get update && apt-get install -y bash curl ca-certificates && rm -rf /var/lib/apt/lists/*
{watchdog}

{entrypoint}
"#,
        watchdog = watchdog_install(),
        entrypoint = watchdog_entrypoint(&manifest.command),
    )
}

fn includes_dependency(deps: &[String], name: &str) -> bool {
    deps.iter().any(|dep| dep == name)
}

fn has_file(context_dir: &Path, name: &str) -> bool {
    context_dir.join(name).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(runtime: &str, command: &str) -> Manifest {
        Manifest {
            runtime: runtime.to_string(),
            command: command.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn python_installs_requirements_when_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "polars\n").unwrap();

        let body = generate_dockerfile(&manifest("python", "python handler.py"), dir.path())
            .unwrap();
        assert!(body.contains("FROM python:3.11-slim"));
        assert!(body.contains("pip install --no-cache-dir -r requirements.txt"));
        assert!(body.contains(r#"ENV fprocess="python handler.py""#));
        assert!(body.contains("EXPOSE 8080"));
        assert!(body.contains(WATCHDOG_VERSION));
    }

    #[test]
    fn python_skips_requirements_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let body =
            generate_dockerfile(&manifest("python", "python handler.py"), dir.path()).unwrap();
        assert!(!body.contains("pip install"));
    }

    #[test]
    fn node_prefers_npm_ci_with_lockfile() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package-lock.json"), "{}").unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();

        let body = generate_dockerfile(&manifest("node", "node index.js"), dir.path()).unwrap();
        assert!(body.contains("RUN npm ci"));
        assert!(!body.contains("RUN npm install"));
    }

    #[test]
    fn go_uses_builder_stage_with_default_steps() {
        let dir = tempfile::tempdir().unwrap();
        let body = generate_dockerfile(&manifest("go", "./app"), dir.path()).unwrap();
        assert!(body.contains("AS builder"));
        assert!(body.contains("RUN go mod download"));
        assert!(body.contains("RUN go build -o app ./"));
        assert!(body.contains("COPY --from=builder /src /home/app"));
    }

    #[test]
    fn go_honours_custom_build_steps() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest("go", "./app");
        m.build = vec!["go build -tags netgo -o app .".to_string()];
        let body = generate_dockerfile(&m, dir.path()).unwrap();
        assert!(body.contains("RUN go build -tags netgo -o app ."));
        assert!(!body.contains("go mod download"));
    }

    #[test]
    fn bash_image_installs_bash() {
        let dir = tempfile::tempdir().unwrap();
        let body = generate_dockerfile(&manifest("bash", "cat"), dir.path()).unwrap();
        assert!(body.contains("apt-get install -y bash"));
    }

    #[test]
    fn unknown_runtime_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(generate_dockerfile(&manifest("ruby", "x"), dir.path()).is_err());
        assert!(generate_dockerfile(&manifest("", "x"), dir.path()).is_err());
    }
}
