//! Shell scripts executed on the hosts
//!
//! Script bodies are minijinja templates held in a [`Scripts`] set that is
//! built once and handed to the orchestration state. Tests swap individual
//! templates with [`Scripts::with_template`]. OS specific scripts are picked
//! by an exhaustive match on [`OperatingSystem`].

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use keel_cluster::OperatingSystem;
use keel_common::{Error, Result};
use keel_executor::render;

/// Every script keel knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Script {
    /// systemd load/active/sub state of `unit`
    UnitStatus,
    /// systemd `ExecStart` of `unit`
    UnitExecStart,
    /// `path --version`
    BinaryVersion,
    /// Docker server version
    DockerVersion,
    /// Exit 0 when kubelet has written its kubeconfig
    KubeletInitialized,
    /// Fully qualified hostname
    Hostname,
    /// `ID` from os-release
    OsRelease,
    /// `notAfter` of the control-plane certificates
    CertExpiry,
    /// Print the admin kubeconfig
    ReadAdminKubeconfig,
    /// Print the kube-controller-manager static pod manifest
    ReadControllerManagerManifest,
    /// Print the encryption provider config, exit 1 when absent
    ReadEncryptionConfig,
    /// Runtime, kubeadm and kubelet on apt based systems
    PrerequisitesApt,
    /// Runtime, kubeadm and kubelet on yum based systems
    PrerequisitesYum,
    /// Runtime, kubeadm and kubelet on Flatcar
    PrerequisitesFlatcar,
    /// `kubeadm init` on the leader
    KubeadmInit,
    /// Print a worker join command
    KubeadmJoinCommand,
    /// Re-upload control-plane certs and print the certificate key
    KubeadmCertificateKey,
    /// Join as control-plane member
    KubeadmJoinControlPlane,
    /// Join as worker
    KubeadmJoinWorker,
    /// `kubeadm upgrade apply` on the leader
    KubeadmUpgradeApply,
    /// `kubeadm upgrade node` on followers and workers
    KubeadmUpgradeNode,
    /// New kubeadm package on apt based systems
    UpgradeKubeadmApt,
    /// New kubeadm package on yum based systems
    UpgradeKubeadmYum,
    /// New kubeadm binary on Flatcar
    UpgradeKubeadmFlatcar,
    /// New kubelet/kubectl packages and a kubelet restart on apt based systems
    UpgradeKubeletApt,
    /// New kubelet/kubectl packages and a kubelet restart on yum based systems
    UpgradeKubeletYum,
    /// New kubelet/kubectl binaries and a kubelet restart on Flatcar
    UpgradeKubeletFlatcar,
    /// Drain `node` (run on the leader)
    DrainNode,
    /// Uncordon `node` (run on the leader)
    UncordonNode,
    /// `kubeadm reset` and cleanup
    KubeadmReset,
    /// Renew control-plane certificates and restart static pods
    RenewCertificates,
}

const UNIT_STATUS: &str =
    "systemctl show {{ unit }} -p LoadState,ActiveState,SubState --no-pager";

const UNIT_EXEC_START: &str = "systemctl show {{ unit }} -p ExecStart --value --no-pager";

const BINARY_VERSION: &str = "{{ path }} --version";

const DOCKER_VERSION: &str =
    "docker version --format '{% raw %}{{.Server.Version}}{% endraw %}'";

const KUBELET_INITIALIZED: &str = "test -f /etc/kubernetes/kubelet.conf";

const HOSTNAME: &str = "hostname -f";

const OS_RELEASE: &str = r#". /etc/os-release && echo "$ID""#;

const CERT_EXPIRY: &str = r#"
for cert in apiserver apiserver-kubelet-client apiserver-etcd-client front-proxy-client; do
  sudo openssl x509 -enddate -noout -in /etc/kubernetes/pki/${cert}.crt 2>/dev/null || true
done
"#;

const READ_ADMIN_KUBECONFIG: &str = "sudo cat /etc/kubernetes/admin.conf";

const READ_CONTROLLER_MANAGER_MANIFEST: &str =
    "sudo cat /etc/kubernetes/manifests/kube-controller-manager.yaml";

const READ_ENCRYPTION_CONFIG: &str = r#"
sudo test -f /etc/kubernetes/encryption-providers/encryption-providers.yaml || exit 1
sudo cat /etc/kubernetes/encryption-providers/encryption-providers.yaml
"#;

const PREREQUISITES_APT: &str = r#"
set -xeuo pipefail
sudo swapoff -a
sudo sed -i '/.*swap.*/d' /etc/fstab
sudo modprobe overlay br_netfilter
sudo mkdir -p /etc/apt/keyrings {{ work_dir }}
curl -fsSL https://pkgs.k8s.io/core:/stable:/v{{ minor }}/deb/Release.key \
  | sudo gpg --batch --yes --dearmor -o /etc/apt/keyrings/kubernetes.gpg
echo "deb [signed-by=/etc/apt/keyrings/kubernetes.gpg] https://pkgs.k8s.io/core:/stable:/v{{ minor }}/deb/ /" \
  | sudo tee /etc/apt/sources.list.d/kubernetes.list
sudo apt-get update
sudo DEBIAN_FRONTEND=noninteractive apt-get install -y --allow-change-held-packages \
  containerd {% if docker %}docker.io {% endif %}kubelet={{ version }}-* kubeadm={{ version }}-* kubectl={{ version }}-*
sudo apt-mark hold kubelet kubeadm kubectl
sudo systemctl enable --now containerd{% if docker %} docker{% endif %} kubelet
"#;

const PREREQUISITES_YUM: &str = r#"
set -xeuo pipefail
sudo swapoff -a
sudo sed -i '/.*swap.*/d' /etc/fstab
sudo setenforce 0 || true
sudo modprobe overlay br_netfilter
sudo mkdir -p {{ work_dir }}
cat <<EOF | sudo tee /etc/yum.repos.d/kubernetes.repo
[kubernetes]
name=Kubernetes
baseurl=https://pkgs.k8s.io/core:/stable:/v{{ minor }}/rpm/
enabled=1
gpgcheck=1
gpgkey=https://pkgs.k8s.io/core:/stable:/v{{ minor }}/rpm/repodata/repomd.xml.key
EOF
sudo yum install -y containerd.io {% if docker %}docker-ce {% endif %}kubelet-{{ version }} kubeadm-{{ version }} kubectl-{{ version }}
sudo systemctl enable --now containerd{% if docker %} docker{% endif %} kubelet
"#;

const PREREQUISITES_FLATCAR: &str = r#"
set -xeuo pipefail
sudo mkdir -p /opt/bin {{ work_dir }}
cd /opt/bin
for bin in kubeadm kubelet kubectl; do
  sudo curl -fsSLo ${bin} https://dl.k8s.io/release/v{{ version }}/bin/linux/amd64/${bin}
  sudo chmod +x ${bin}
done
sudo systemctl enable --now containerd kubelet
"#;

const KUBEADM_INIT: &str = r#"
sudo kubeadm init \
  --kubernetes-version=v{{ version }} \
  --control-plane-endpoint={{ endpoint }} \
  --node-name={{ node }} \
  --upload-certs{% if verbose %} --v=6{% endif %}
"#;

const KUBEADM_JOIN_COMMAND: &str = "sudo kubeadm token create --print-join-command";

const KUBEADM_CERTIFICATE_KEY: &str =
    "sudo kubeadm init phase upload-certs --upload-certs 2>/dev/null | tail -n 1";

const KUBEADM_JOIN_CONTROL_PLANE: &str = r#"
sudo {{ join_command }} \
  --control-plane \
  --certificate-key={{ certificate_key }} \
  --node-name={{ node }}{% if verbose %} --v=6{% endif %}
"#;

const KUBEADM_JOIN_WORKER: &str =
    "sudo {{ join_command }} --node-name={{ node }}{% if verbose %} --v=6{% endif %}";

const KUBEADM_UPGRADE_APPLY: &str =
    "sudo kubeadm upgrade apply -y v{{ version }}{% if verbose %} --v=6{% endif %}";

const KUBEADM_UPGRADE_NODE: &str = "sudo kubeadm upgrade node{% if verbose %} --v=6{% endif %}";

const UPGRADE_KUBEADM_APT: &str = r#"
set -xeuo pipefail
sudo apt-get update
sudo DEBIAN_FRONTEND=noninteractive apt-get install -y --allow-change-held-packages \
  kubeadm={{ version }}-*
sudo apt-mark hold kubeadm
"#;

const UPGRADE_KUBEADM_YUM: &str = r#"
set -xeuo pipefail
sudo yum install -y kubeadm-{{ version }}
"#;

const UPGRADE_KUBEADM_FLATCAR: &str = r#"
set -xeuo pipefail
cd /opt/bin
sudo curl -fsSLo kubeadm.new https://dl.k8s.io/release/v{{ version }}/bin/linux/amd64/kubeadm
sudo chmod +x kubeadm.new
sudo mv kubeadm.new kubeadm
"#;

const UPGRADE_KUBELET_APT: &str = r#"
set -xeuo pipefail
sudo DEBIAN_FRONTEND=noninteractive apt-get install -y --allow-change-held-packages \
  kubelet={{ version }}-* kubectl={{ version }}-*
sudo apt-mark hold kubelet kubectl
sudo systemctl daemon-reload
sudo systemctl restart kubelet
"#;

const UPGRADE_KUBELET_YUM: &str = r#"
set -xeuo pipefail
sudo yum install -y kubelet-{{ version }} kubectl-{{ version }}
sudo systemctl daemon-reload
sudo systemctl restart kubelet
"#;

const UPGRADE_KUBELET_FLATCAR: &str = r#"
set -xeuo pipefail
cd /opt/bin
for bin in kubelet kubectl; do
  sudo curl -fsSLo ${bin}.new https://dl.k8s.io/release/v{{ version }}/bin/linux/amd64/${bin}
  sudo chmod +x ${bin}.new
  sudo mv ${bin}.new ${bin}
done
sudo systemctl daemon-reload
sudo systemctl restart kubelet
"#;

const DRAIN_NODE: &str = "sudo kubectl --kubeconfig=/etc/kubernetes/admin.conf drain {{ node }} \
  --ignore-daemonsets --delete-emptydir-data --timeout=5m";

const UNCORDON_NODE: &str =
    "sudo kubectl --kubeconfig=/etc/kubernetes/admin.conf uncordon {{ node }}";

const KUBEADM_RESET: &str = r#"
sudo kubeadm reset --force{% if verbose %} --v=6{% endif %}
sudo rm -rf /etc/kubernetes /var/lib/etcd /var/lib/kubelet {{ work_dir }}
"#;

const RENEW_CERTIFICATES: &str = r#"
set -xeuo pipefail
sudo kubeadm certs renew all
for pod in kube-apiserver kube-controller-manager kube-scheduler; do
  sudo crictl pods --name "${pod}" -q | xargs -r sudo crictl stopp
done
"#;

/// The template set scripts are rendered from
#[derive(Debug, Clone)]
pub struct Scripts {
    templates: HashMap<Script, String>,
}

impl Default for Scripts {
    fn default() -> Self {
        Self::embedded()
    }
}

impl Scripts {
    /// The templates compiled into keel
    pub fn embedded() -> Self {
        let templates = [
            (Script::UnitStatus, UNIT_STATUS),
            (Script::UnitExecStart, UNIT_EXEC_START),
            (Script::BinaryVersion, BINARY_VERSION),
            (Script::DockerVersion, DOCKER_VERSION),
            (Script::KubeletInitialized, KUBELET_INITIALIZED),
            (Script::Hostname, HOSTNAME),
            (Script::OsRelease, OS_RELEASE),
            (Script::CertExpiry, CERT_EXPIRY),
            (Script::ReadAdminKubeconfig, READ_ADMIN_KUBECONFIG),
            (
                Script::ReadControllerManagerManifest,
                READ_CONTROLLER_MANAGER_MANIFEST,
            ),
            (Script::ReadEncryptionConfig, READ_ENCRYPTION_CONFIG),
            (Script::PrerequisitesApt, PREREQUISITES_APT),
            (Script::PrerequisitesYum, PREREQUISITES_YUM),
            (Script::PrerequisitesFlatcar, PREREQUISITES_FLATCAR),
            (Script::KubeadmInit, KUBEADM_INIT),
            (Script::KubeadmJoinCommand, KUBEADM_JOIN_COMMAND),
            (Script::KubeadmCertificateKey, KUBEADM_CERTIFICATE_KEY),
            (Script::KubeadmJoinControlPlane, KUBEADM_JOIN_CONTROL_PLANE),
            (Script::KubeadmJoinWorker, KUBEADM_JOIN_WORKER),
            (Script::KubeadmUpgradeApply, KUBEADM_UPGRADE_APPLY),
            (Script::KubeadmUpgradeNode, KUBEADM_UPGRADE_NODE),
            (Script::UpgradeKubeadmApt, UPGRADE_KUBEADM_APT),
            (Script::UpgradeKubeadmYum, UPGRADE_KUBEADM_YUM),
            (Script::UpgradeKubeadmFlatcar, UPGRADE_KUBEADM_FLATCAR),
            (Script::UpgradeKubeletApt, UPGRADE_KUBELET_APT),
            (Script::UpgradeKubeletYum, UPGRADE_KUBELET_YUM),
            (Script::UpgradeKubeletFlatcar, UPGRADE_KUBELET_FLATCAR),
            (Script::DrainNode, DRAIN_NODE),
            (Script::UncordonNode, UNCORDON_NODE),
            (Script::KubeadmReset, KUBEADM_RESET),
            (Script::RenewCertificates, RENEW_CERTIFICATES),
        ]
        .into_iter()
        .map(|(script, body)| (script, body.to_string()))
        .collect();

        Self { templates }
    }

    /// Replace one template
    pub fn with_template(mut self, script: Script, template: impl Into<String>) -> Self {
        self.templates.insert(script, template.into());
        self
    }

    /// Render `script` with `params`
    pub fn render<S: Serialize>(&self, script: Script, params: S) -> Result<String> {
        let template = self.templates.get(&script).ok_or_else(|| {
            Error::internal_with_context("scripts", format!("no template for {:?}", script))
        })?;
        render(template, params)
    }
}

/// Parameters every script is rendered with, plus script specific extras
#[derive(Debug, Clone, Serialize)]
pub struct Params {
    /// Scratch directory on the host
    pub work_dir: String,
    /// Node the script acts on
    pub node: String,
    /// Ask tools for verbose output
    pub verbose: bool,
    #[serde(flatten)]
    extra: BTreeMap<String, String>,
}

impl Params {
    /// Common parameters
    pub fn new(work_dir: impl Into<String>, node: impl Into<String>, verbose: bool) -> Self {
        Self {
            work_dir: work_dir.into(),
            node: node.into(),
            verbose,
            extra: BTreeMap::new(),
        }
    }

    /// Add a script specific parameter
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.extra.insert(key.into(), value.to_string());
        self
    }

    /// Add a boolean flag (rendered as a truthy/falsy string)
    pub fn flag(self, key: impl Into<String>, value: bool) -> Self {
        self.with(key, if value { "true" } else { "" })
    }
}

/// Script installing runtime, kubeadm and kubelet on `os`
pub fn prerequisites_script(os: OperatingSystem) -> Result<Script> {
    match os {
        OperatingSystem::Ubuntu | OperatingSystem::Debian => Ok(Script::PrerequisitesApt),
        OperatingSystem::CentOS
        | OperatingSystem::Rhel
        | OperatingSystem::RockyLinux
        | OperatingSystem::AmazonLinux => Ok(Script::PrerequisitesYum),
        OperatingSystem::Flatcar => Ok(Script::PrerequisitesFlatcar),
        OperatingSystem::Unknown => Err(Error::validation_for_field(
            "operatingSystem",
            "operating system not discovered; set it explicitly",
        )),
    }
}

/// Script replacing kubeadm on `os`, run before `kubeadm upgrade`
pub fn upgrade_kubeadm_script(os: OperatingSystem) -> Result<Script> {
    match os {
        OperatingSystem::Ubuntu | OperatingSystem::Debian => Ok(Script::UpgradeKubeadmApt),
        OperatingSystem::CentOS
        | OperatingSystem::Rhel
        | OperatingSystem::RockyLinux
        | OperatingSystem::AmazonLinux => Ok(Script::UpgradeKubeadmYum),
        OperatingSystem::Flatcar => Ok(Script::UpgradeKubeadmFlatcar),
        OperatingSystem::Unknown => Err(Error::validation_for_field(
            "operatingSystem",
            "operating system not discovered; set it explicitly",
        )),
    }
}

/// Script replacing and restarting kubelet on `os`, run after `kubeadm upgrade`
pub fn upgrade_kubelet_script(os: OperatingSystem) -> Result<Script> {
    match os {
        OperatingSystem::Ubuntu | OperatingSystem::Debian => Ok(Script::UpgradeKubeletApt),
        OperatingSystem::CentOS
        | OperatingSystem::Rhel
        | OperatingSystem::RockyLinux
        | OperatingSystem::AmazonLinux => Ok(Script::UpgradeKubeletYum),
        OperatingSystem::Flatcar => Ok(Script::UpgradeKubeletFlatcar),
        OperatingSystem::Unknown => Err(Error::validation_for_field(
            "operatingSystem",
            "operating system not discovered; set it explicitly",
        )),
    }
}
