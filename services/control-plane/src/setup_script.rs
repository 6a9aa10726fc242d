//! Startup-script rendering.
//!
//! The script an instance executes on first boot: install the pinned agent
//! version, register against the target scope with the issued token, run
//! one job, exit. `--ephemeral` is what makes runners single-use.

/// Everything the script embeds.
#[derive(Debug)]
pub struct SetupParams<'a> {
    /// Registration name, `myshoes-{runner id}`.
    pub runner_name: &'a str,
    /// Scope URL the runner registers against.
    pub scope_url: &'a str,
    /// Registration token.
    pub token: &'a str,
    /// OS user that owns the runner process; root when unset.
    pub runner_user: Option<&'a str>,
    /// Agent version, `latest` or `x.y.z`.
    pub runner_version: &'a str,
    /// Labels advertised by the runner.
    pub labels: &'a [String],
}

pub fn render(params: &SetupParams<'_>) -> String {
    let labels = params.labels.join(",");
    let run_as = params.runner_user.unwrap_or("root");

    format!(
        r#"#!/bin/bash
set -euo pipefail

RUNNER_VERSION="{version}"
RUNNER_DIR=/opt/myshoes-runner

mkdir -p "${{RUNNER_DIR}}"
cd "${{RUNNER_DIR}}"

if [ "${{RUNNER_VERSION}}" = "latest" ]; then
    RUNNER_VERSION=$(curl -fsSL https://api.github.com/repos/actions/runner/releases/latest | jq -r '.tag_name' | sed -e 's/^v//')
fi

curl -fsSL -o runner.tar.gz \
    "https://github.com/actions/runner/releases/download/v${{RUNNER_VERSION}}/actions-runner-linux-x64-${{RUNNER_VERSION}}.tar.gz"
tar xzf runner.tar.gz
chown -R {run_as} "${{RUNNER_DIR}}"

sudo -u {run_as} ./config.sh \
    --unattended \
    --ephemeral \
    --url "{scope_url}" \
    --token "{token}" \
    --name "{runner_name}" \
    --labels "{labels}"

./svc.sh install {run_as}
./svc.sh start
"#,
        version = params.runner_version,
        run_as = run_as,
        scope_url = params.scope_url,
        token = params.token,
        runner_name = params.runner_name,
        labels = labels,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_embeds_registration_details() {
        let labels = vec!["myshoes".to_string(), "nano".to_string()];
        let script = render(&SetupParams {
            runner_name: "myshoes-rnr_01ABC",
            scope_url: "https://github.com/acme/widget",
            token: "AABBCC",
            runner_user: Some("runner"),
            runner_version: "2.300.0",
            labels: &labels,
        });

        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("--url \"https://github.com/acme/widget\""));
        assert!(script.contains("--token \"AABBCC\""));
        assert!(script.contains("--name \"myshoes-rnr_01ABC\""));
        assert!(script.contains("--labels \"myshoes,nano\""));
        assert!(script.contains("--ephemeral"));
        assert!(script.contains("sudo -u runner"));
        assert!(script.contains("RUNNER_VERSION=\"2.300.0\""));
        // A pinned version must not hit the releases API.
        assert!(script.contains("if [ \"${RUNNER_VERSION}\" = \"latest\" ]"));
    }

    #[test]
    fn defaults_to_root_without_a_runner_user() {
        let script = render(&SetupParams {
            runner_name: "myshoes-rnr_01ABC",
            scope_url: "https://github.com/acme",
            token: "AABBCC",
            runner_user: None,
            runner_version: "latest",
            labels: &[],
        });
        assert!(script.contains("sudo -u root"));
    }
}
