use std::path::Path;

use crate::error::Result;
use crate::remote::RemoteSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Template {
    pub name: &'static str,
    pub remote_path: &'static str,
    pub content: &'static str,
    pub executable: bool,
}

pub const STUNNEL_DEFAULTS: Template = Template {
    name: "stunnel4.default",
    remote_path: "/etc/default/stunnel4",
    content: include_str!("../templates/stunnel4.default"),
    executable: false,
};

pub const STUNNEL_CENTOS_INIT: Template = Template {
    name: "stunnel4.centos.init",
    remote_path: "/etc/rc.d/init.d/stunnel4",
    content: include_str!("../templates/stunnel4.centos.init"),
    executable: true,
};

pub const REDIS_CLUSTER_INIT: Template = Template {
    name: "redis-server.init",
    remote_path: "/etc/init.d/redis-server",
    content: include_str!("../templates/redis-server.init"),
    executable: true,
};

/// Push a template to the host. A file of the same name in `template_dir`
/// replaces the embedded copy.
pub fn push_template(
    session: &mut dyn RemoteSession,
    template: &Template,
    template_dir: Option<&Path>,
) -> Result<()> {
    match template_dir
        .map(|dir| dir.join(template.name))
        .filter(|local| local.is_file())
    {
        Some(local) => session.upload_file(&local, template.remote_path)?,
        None => session.write_file(template.remote_path, template.content)?,
    }

    if template.executable {
        session.run(&format!("chmod +x {}", template.remote_path))?;
    }
    Ok(())
}
