//! 项目生命周期状态机
//!
//! pending → active → completed；active ⇄ paused；pending|active|paused → cancelled；
//! 任意非终止状态 → failed。completed / failed / cancelled 为终止状态。

use serde::{Deserialize, Serialize};

/// 本地项目生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Pending,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ProjectStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProjectStatus::Completed | ProjectStatus::Failed | ProjectStatus::Cancelled
        )
    }

    /// 轮询只关心这两种状态
    pub fn is_monitored(self) -> bool {
        matches!(self, ProjectStatus::Pending | ProjectStatus::Active)
    }

    pub fn can_transition_to(self, next: ProjectStatus) -> bool {
        use ProjectStatus::*;
        match (self, next) {
            (Pending, Active) | (Active, Completed) => true,
            (Active, Paused) | (Paused, Active) => true,
            (Pending | Active | Paused, Cancelled) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

str_enum!(ProjectStatus {
    Pending => "pending",
    Active => "active",
    Paused => "paused",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

/// Vamsh 侧状态（与本地生命周期分开追踪）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Unknown,
    Working,
    Inactive,
    Unreachable,
    /// 本地仍在进行时 Vamsh 报告 inactive，且未按完成处理
    Interrupted,
}

str_enum!(RemoteStatus {
    Unknown => "unknown",
    Working => "working",
    Inactive => "inactive",
    Unreachable => "unreachable",
    Interrupted => "interrupted",
});

#[cfg(test)]
mod tests {
    use super::*;
    use ProjectStatus::*;

    #[test]
    fn test_allowed_transitions() {
        assert!(Pending.can_transition_to(Active));
        assert!(Active.can_transition_to(Completed));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Paused.can_transition_to(Cancelled));
        assert!(Active.can_transition_to(Failed));
        assert!(Paused.can_transition_to(Failed));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Active, Paused, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Paused));
    }

    #[test]
    fn test_status_strings() {
        for status in [Pending, Active, Paused, Completed, Failed, Cancelled] {
            assert_eq!(status.as_str().parse::<ProjectStatus>().unwrap(), status);
        }
        assert!("done".parse::<ProjectStatus>().is_err());
        assert_eq!("interrupted".parse::<RemoteStatus>().unwrap(), RemoteStatus::Interrupted);
    }
}
