// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client-side `hadoop-site.xml` for a launched cluster
//!
//! The file points a client at the cluster's control plane and worker
//! coordinator through the local SOCKS tunnel.

use camino::{Utf8Path, Utf8PathBuf};
use std::fmt;
use thiserror::Error;

pub const SITE_FILE_NAME: &str = "hadoop-site.xml";

#[derive(Debug, Error)]
pub enum SiteFileError {
    #[error("failed to create directory {path}")]
    CreateDir {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to write {path}")]
    Write {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

/// Object-store credentials handed to the client
#[derive(Clone)]
pub struct StorageCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for StorageCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Everything that goes into the site file
#[derive(Debug)]
pub struct SiteFileParams<'a> {
    pub control_plane_host: &'a str,
    pub control_plane_rpc_port: u16,
    pub coordinator_host: &'a str,
    pub coordinator_rpc_port: u16,
    pub socks_port: u16,
    /// User and group the client's jobs run as
    pub user: &'a str,
    pub credentials: &'a StorageCredentials,
}

/// Directory holding the client files for `cluster_name`
pub fn cluster_dir(config_dir: &Utf8Path, cluster_name: &str) -> Utf8PathBuf {
    config_dir.join(".hadoop").join(cluster_name)
}

pub fn render_site_file(params: &SiteFileParams<'_>) -> String {
    let credentials = params.credentials;
    let properties = [
        ("hadoop.job.ugi", format!("{},{}", params.user, params.user)),
        (
            "fs.default.name",
            format!(
                "hdfs://{}:{}/",
                params.control_plane_host, params.control_plane_rpc_port
            ),
        ),
        (
            "mapred.job.tracker",
            format!(
                "{}:{}",
                params.coordinator_host, params.coordinator_rpc_port
            ),
        ),
        ("hadoop.socks.server", format!("localhost:{}", params.socks_port)),
        (
            "hadoop.rpc.socket.factory.class.default",
            String::from("org.apache.hadoop.net.SocksSocketFactory"),
        ),
        ("fs.s3.awsAccessKeyId", credentials.access_key_id.clone()),
        ("fs.s3.awsSecretAccessKey", credentials.secret_access_key.clone()),
        ("fs.s3n.awsAccessKeyId", credentials.access_key_id.clone()),
        ("fs.s3n.awsSecretAccessKey", credentials.secret_access_key.clone()),
    ];

    let mut out = String::from(
        "<?xml version=\"1.0\"?>\n\
         <?xml-stylesheet type=\"text/xsl\" href=\"configuration.xsl\"?>\n\
         <!-- Put site-specific property overrides in this file. -->\n\
         <configuration>\n",
    );
    for (name, value) in properties {
        out.push_str("    <property>\n");
        out.push_str(&format!("        <name>{}</name>\n", name));
        out.push_str(&format!(
            "        <value>{}</value>\n",
            xml_escape(&value)
        ));
        out.push_str("    </property>\n");
    }
    out.push_str("</configuration>\n");
    out
}

fn xml_escape(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Write the site file for `cluster_name` under `config_dir`, creating
/// directories as needed.  Returns the path written.
pub fn write_site_file(
    config_dir: &Utf8Path,
    cluster_name: &str,
    params: &SiteFileParams<'_>,
) -> Result<Utf8PathBuf, SiteFileError> {
    let dir = cluster_dir(config_dir, cluster_name);
    std::fs::create_dir_all(&dir)
        .map_err(|err| SiteFileError::CreateDir { path: dir.clone(), err })?;
    let path = dir.join(SITE_FILE_NAME);
    std::fs::write(&path, render_site_file(params))
        .map_err(|err| SiteFileError::Write { path: path.clone(), err })?;
    Ok(path)
}
