//! Windows Task Scheduler backend driven through the `ITaskService` COM API
//!
//! Failures are classified by HRESULT, never by message text, so the
//! outcome is the same on every display language.

use super::{AutostartBackend, AutostartRegistration, UnregisterStatus};
use crate::error::FailureReason;
#[cfg(windows)]
use super::Trigger;
#[cfg(windows)]
use std::path::PathBuf;
#[cfg(windows)]
use tracing::{debug, warn};

// HRESULT_FROM_WIN32 values
const HR_FILE_NOT_FOUND: u32 = 0x8007_0002;
const HR_PATH_NOT_FOUND: u32 = 0x8007_0003;
const HR_ACCESS_DENIED: u32 = 0x8007_0005;
const HR_SERVICE_DISABLED: u32 = 0x8007_0422;
const HR_RPC_SERVER_UNAVAILABLE: u32 = 0x8007_06BA;
const HR_RPC_CALL_FAILED: u32 = 0x8007_06BE;
// Task Scheduler and COM activation
const SCHED_E_SERVICE_NOT_RUNNING: u32 = 0x8004_1315;
const CO_E_SERVER_EXEC_FAILURE: u32 = 0x8008_0005;
const REGDB_E_CLASSNOTREG: u32 = 0x8004_0154;

#[derive(Debug, Default, Clone)]
pub struct TaskSchedulerBackend;

/// What a failed scheduler call meant
#[derive(Debug, Clone, PartialEq, Eq)]
enum SchedulerError {
    NotFound,
    Failed(FailureReason),
}

impl TaskSchedulerBackend {
    pub fn new() -> Self {
        TaskSchedulerBackend
    }
}

fn classify_hresult(code: u32, message: &str) -> SchedulerError {
    match code {
        HR_FILE_NOT_FOUND | HR_PATH_NOT_FOUND => SchedulerError::NotFound,
        HR_ACCESS_DENIED => SchedulerError::Failed(FailureReason::PermissionDenied),
        HR_SERVICE_DISABLED
        | HR_RPC_SERVER_UNAVAILABLE
        | HR_RPC_CALL_FAILED
        | SCHED_E_SERVICE_NOT_RUNNING
        | CO_E_SERVER_EXEC_FAILURE
        | REGDB_E_CLASSNOTREG => SchedulerError::Failed(FailureReason::ServiceUnavailable),
        _ => SchedulerError::Failed(FailureReason::SchedulerRejected(format!(
            "0x{:08x}: {}",
            code,
            message.trim()
        ))),
    }
}

#[cfg(windows)]
fn com_error(context: &str, err: windows::core::Error) -> SchedulerError {
    let classified = classify_hresult(err.code().0 as u32, &err.message().to_string());
    if classified != SchedulerError::NotFound {
        warn!("{} failed: {}", context, err);
    }
    classified
}

#[cfg(windows)]
fn with_task_service<T, F>(f: F) -> Result<T, SchedulerError>
where
    F: FnOnce(
        &windows::Win32::System::TaskScheduler::ITaskService,
        &windows::Win32::System::TaskScheduler::ITaskFolder,
    ) -> Result<T, SchedulerError>,
{
    use windows::core::BSTR;
    use windows::Win32::Foundation::RPC_E_CHANGED_MODE;
    use windows::Win32::System::Com::{
        CoCreateInstance, CoInitializeEx, CoUninitialize, CLSCTX_INPROC_SERVER,
        COINIT_MULTITHREADED,
    };
    use windows::Win32::System::TaskScheduler::{ITaskService, TaskScheduler};
    use windows::Win32::System::Variant::VARIANT;

    struct CoUninit(bool);
    impl Drop for CoUninit {
        fn drop(&mut self) {
            if self.0 {
                unsafe { CoUninitialize() }
            }
        }
    }

    unsafe {
        // S_FALSE is Ok too and still needs a matching uninitialize
        let did_init = match CoInitializeEx(None, COINIT_MULTITHREADED) {
            Ok(()) => true,
            Err(e) if e.code() == RPC_E_CHANGED_MODE => false,
            Err(e) => return Err(com_error("CoInitializeEx", e)),
        };
        let _guard = CoUninit(did_init);

        let service: ITaskService = CoCreateInstance(&TaskScheduler, None, CLSCTX_INPROC_SERVER)
            .map_err(|e| com_error("CoCreateInstance(TaskScheduler)", e))?;
        service
            .Connect(
                &VARIANT::default(),
                &VARIANT::default(),
                &VARIANT::default(),
                &VARIANT::default(),
            )
            .map_err(|e| com_error("ITaskService::Connect", e))?;
        let folder = service
            .GetFolder(&BSTR::from("\\"))
            .map_err(|e| com_error("GetFolder", e))?;

        f(&service, &folder)
    }
}

#[cfg(windows)]
fn query_task(task_name: &str) -> Result<AutostartRegistration, SchedulerError> {
    use windows::core::{ComInterface, BSTR};
    use windows::Win32::System::TaskScheduler::{
        IExecAction, TASK_RUNLEVEL_HIGHEST, TASK_RUNLEVEL_LUA, TASK_TRIGGER_LOGON,
        TASK_TRIGGER_TYPE2,
    };

    with_task_service(|_service, folder| unsafe {
        let task = folder
            .GetTask(&BSTR::from(task_name))
            .map_err(|e| com_error("GetTask", e))?;
        let definition = task.Definition().map_err(|e| com_error("Definition", e))?;

        let principal = definition
            .Principal()
            .map_err(|e| com_error("Principal", e))?;
        let mut run_level = TASK_RUNLEVEL_LUA;
        principal
            .RunLevel(&mut run_level)
            .map_err(|e| com_error("RunLevel", e))?;

        let actions = definition.Actions().map_err(|e| com_error("Actions", e))?;
        let exec: IExecAction = actions
            .get_Item(1)
            .and_then(|action| action.cast())
            .map_err(|e| com_error("exec action", e))?;
        let mut path = BSTR::new();
        exec.Path(&mut path).map_err(|e| com_error("Path", e))?;

        let triggers = definition
            .Triggers()
            .map_err(|e| com_error("Triggers", e))?;
        let mut count = 0;
        triggers
            .Count(&mut count)
            .map_err(|e| com_error("Triggers::Count", e))?;
        let mut has_logon = false;
        for index in 1..=count {
            if let Ok(trigger) = triggers.get_Item(index) {
                let mut kind = TASK_TRIGGER_TYPE2::default();
                if trigger.Type(&mut kind).is_ok() && kind == TASK_TRIGGER_LOGON {
                    has_logon = true;
                }
            }
        }
        if !has_logon {
            debug!("task '{}' has no logon trigger", task_name);
        }

        Ok(AutostartRegistration {
            task_name: task_name.to_string(),
            target_path: PathBuf::from(path.to_string().trim_matches('"')),
            run_as_highest_privilege: run_level == TASK_RUNLEVEL_HIGHEST,
            trigger: Trigger::Logon,
        })
    })
}

#[cfg(windows)]
fn register_task(registration: &AutostartRegistration) -> Result<(), SchedulerError> {
    use windows::core::{ComInterface, BSTR};
    use windows::Win32::Foundation::{VARIANT_FALSE, VARIANT_TRUE};
    use windows::Win32::System::TaskScheduler::{
        IExecAction, TASK_ACTION_EXEC, TASK_CREATE_OR_UPDATE, TASK_LOGON_INTERACTIVE_TOKEN,
        TASK_RUNLEVEL_HIGHEST, TASK_RUNLEVEL_LUA, TASK_TRIGGER_LOGON,
    };
    use windows::Win32::System::Variant::VARIANT;

    with_task_service(|service, folder| unsafe {
        let definition = service.NewTask(0).map_err(|e| com_error("NewTask", e))?;

        let principal = definition
            .Principal()
            .map_err(|e| com_error("Principal", e))?;
        principal
            .SetLogonType(TASK_LOGON_INTERACTIVE_TOKEN)
            .map_err(|e| com_error("SetLogonType", e))?;
        let run_level = if registration.run_as_highest_privilege {
            TASK_RUNLEVEL_HIGHEST
        } else {
            TASK_RUNLEVEL_LUA
        };
        principal
            .SetRunLevel(run_level)
            .map_err(|e| com_error("SetRunLevel", e))?;

        let settings = definition
            .Settings()
            .map_err(|e| com_error("Settings", e))?;
        let _ = settings.SetEnabled(VARIANT_TRUE);
        let _ = settings.SetDisallowStartIfOnBatteries(VARIANT_FALSE);
        let _ = settings.SetStopIfGoingOnBatteries(VARIANT_FALSE);
        // PT0S: no execution time limit for a long-running monitor
        let _ = settings.SetExecutionTimeLimit(&BSTR::from("PT0S"));

        let triggers = definition
            .Triggers()
            .map_err(|e| com_error("Triggers", e))?;
        match registration.trigger {
            Trigger::Logon => {
                triggers
                    .Create(TASK_TRIGGER_LOGON)
                    .map_err(|e| com_error("Create trigger", e))?;
            }
        }

        let actions = definition.Actions().map_err(|e| com_error("Actions", e))?;
        let exec: IExecAction = actions
            .Create(TASK_ACTION_EXEC)
            .and_then(|action| action.cast())
            .map_err(|e| com_error("Create action", e))?;
        exec.SetPath(&BSTR::from(registration.target_path.to_string_lossy().as_ref()))
            .map_err(|e| com_error("SetPath", e))?;
        if let Some(dir) = registration.target_path.parent() {
            let _ = exec.SetWorkingDirectory(&BSTR::from(dir.to_string_lossy().as_ref()));
        }

        debug!("registering task '{}'", registration.task_name);
        folder
            .RegisterTaskDefinition(
                &BSTR::from(registration.task_name.as_str()),
                &definition,
                TASK_CREATE_OR_UPDATE.0,
                &VARIANT::default(),
                &VARIANT::default(),
                TASK_LOGON_INTERACTIVE_TOKEN,
                &VARIANT::default(),
            )
            .map_err(|e| com_error("RegisterTaskDefinition", e))?;
        Ok(())
    })
}

#[cfg(windows)]
fn delete_task(task_name: &str) -> Result<(), SchedulerError> {
    use windows::core::BSTR;

    with_task_service(|_service, folder| unsafe {
        folder
            .DeleteTask(&BSTR::from(task_name), 0)
            .map_err(|e| com_error("DeleteTask", e))
    })
}

#[cfg(not(windows))]
fn query_task(_task_name: &str) -> Result<AutostartRegistration, SchedulerError> {
    Err(SchedulerError::Failed(FailureReason::Unsupported))
}

#[cfg(not(windows))]
fn register_task(_registration: &AutostartRegistration) -> Result<(), SchedulerError> {
    Err(SchedulerError::Failed(FailureReason::Unsupported))
}

#[cfg(not(windows))]
fn delete_task(_task_name: &str) -> Result<(), SchedulerError> {
    Err(SchedulerError::Failed(FailureReason::Unsupported))
}

impl AutostartBackend for TaskSchedulerBackend {
    fn query(&self, task_name: &str) -> Result<Option<AutostartRegistration>, FailureReason> {
        match query_task(task_name) {
            Ok(registration) => Ok(Some(registration)),
            Err(SchedulerError::NotFound) => Ok(None),
            Err(SchedulerError::Failed(reason)) => Err(reason),
        }
    }

    fn register(&self, registration: &AutostartRegistration) -> Result<(), FailureReason> {
        match register_task(registration) {
            Ok(()) => Ok(()),
            // a missing folder or action path while creating is a rejection
            Err(SchedulerError::NotFound) => Err(FailureReason::SchedulerRejected(
                "task could not be created".to_string(),
            )),
            Err(SchedulerError::Failed(reason)) => Err(reason),
        }
    }

    fn unregister(&self, task_name: &str) -> Result<UnregisterStatus, FailureReason> {
        match delete_task(task_name) {
            Ok(()) => Ok(UnregisterStatus::Removed),
            Err(SchedulerError::NotFound) => Ok(UnregisterStatus::NotFound),
            Err(SchedulerError::Failed(reason)) => Err(reason),
        }
    }
}
