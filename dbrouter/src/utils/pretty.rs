use std::fmt::Display;

use crate::cluster::{ManagedInstance, MemberRole, ServerMode};

// Displays a member list the way it is logged after a topology change:
// one `host:port mode/role` entry per member.
pub(crate) struct InstancesDisplayer<'a>(pub(crate) &'a [ManagedInstance]);

impl Display for InstancesDisplayer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return f.write_str("(none)");
        }
        for (idx, instance) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            let mode = match instance.mode {
                ServerMode::ReadWrite => "RW",
                ServerMode::ReadOnly => "RO",
                ServerMode::Unavailable => "n/a",
            };
            let role = match instance.role {
                MemberRole::Primary => "PRIMARY",
                MemberRole::Secondary => "SECONDARY",
                MemberRole::Unavailable => "UNAVAILABLE",
            };
            write!(f, "{} {}/{}", instance.address, mode, role)?;
            if instance.hidden {
                f.write_str(" hidden")?;
            }
            if instance.ignore {
                f.write_str(" ignored")?;
            }
        }
        Ok(())
    }
}
