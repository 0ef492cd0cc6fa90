//! JVM entry points
//!
//! Exports the native methods of `com.cactus.CactusLibrary` and
//! `com.cactus.utils.DeviceInfo_androidKt`:
//!
//! ```kotlin
//! external fun cactus_init(modelPath: String, contextSize: Int): Long
//! external fun cactus_complete(
//!     model: Long, messagesJson: String, responseBuffer: ByteArray, bufferSize: Int,
//!     optionsJson: String?, toolsJson: String?, callback: ((String, Int) -> Unit)?
//! ): Int
//! external fun cactus_destroy(model: Long)
//!
//! external fun nativeRegisterApp(encryptedPayload: String): String?
//! external fun nativeGetDeviceId(): String?
//! external fun nativeSetAndroidDataDirectory(dataDirectory: String)
//! ```
//!
//! Models are addressed by ids from a process-wide [`HandleTable`]; `0` means
//! creation failed. Argument problems throw `IllegalArgumentException`,
//! lifecycle violations throw `IllegalStateException`, and engine failure
//! codes are returned unchanged. No panic crosses into the JVM.

use crate::callback::TokenCallback;
use crate::engine::EngineApi;
use crate::error::BridgeError;
use crate::guard;
use crate::host::{HostError, HostFault, ManagedEnv};
use crate::lifecycle::{CompletionRequest, HandleTable, LifecycleError, Model};
use crate::loader::LibraryLoader;
use crate::marshal::{self, MarshalError, ResponseBuffer};
use crate::utility::{UtilityApi, UtilityProxy};
use cactus_config::{Config, ConfigLoader};
use jni::objects::{
    GlobalRef, JByteArray, JClass, JMethodID, JObject, JString, JValue, ReleaseMode,
};
use jni::signature::ReturnType;
use jni::sys::{jint, jlong, jstring};
use jni::JNIEnv;
use std::borrow::Cow;
use std::path::Path;
use std::sync::OnceLock;

const ILLEGAL_ARGUMENT: &str = "java/lang/IllegalArgumentException";
const ILLEGAL_STATE: &str = "java/lang/IllegalStateException";
const RUNTIME_EXCEPTION: &str = "java/lang/RuntimeException";

/// `kotlin.jvm.functions.Function2.invoke`, erased
const INVOKE_NAME: &str = "invoke";
const INVOKE_SIG: &str = "(Ljava/lang/Object;Ljava/lang/Object;)Ljava/lang/Object;";

static ENGINE: OnceLock<Result<EngineApi, String>> = OnceLock::new();
static UTILITY: OnceLock<Result<UtilityProxy, String>> = OnceLock::new();
static MODELS: OnceLock<HandleTable> = OnceLock::new();

/// Use `api` instead of loading the engine library on first use
///
/// Returns `false` if an engine is already in place.
pub fn install_engine(api: EngineApi) -> bool {
    ENGINE.set(Ok(api)).is_ok()
}

/// Use `api` instead of loading the utility library on first use
pub fn install_utility(api: UtilityApi) -> bool {
    UTILITY.set(Ok(UtilityProxy::new(api))).is_ok()
}

fn models() -> &'static HandleTable {
    MODELS.get_or_init(HandleTable::new)
}

fn host_config() -> Config {
    let start = std::env::current_dir().unwrap_or_else(|_| Path::new("/").to_path_buf());
    ConfigLoader::new()
        .load_from_directory(&start)
        .unwrap_or_else(|err| {
            tracing::warn!(error = %err, "Configuration unreadable; using defaults");
            Config::default()
        })
}

fn engine() -> Result<&'static EngineApi, JvmError> {
    ENGINE
        .get_or_init(|| {
            let config = host_config();
            let mut loader = LibraryLoader::with_search_paths(config.search_paths().to_vec());
            EngineApi::load(&mut loader, config.engine_library()).map_err(|e| e.to_string())
        })
        .as_ref()
        .map_err(|e| JvmError::State(format!("engine unavailable: {}", e)))
}

fn utility() -> Result<&'static UtilityProxy, JvmError> {
    UTILITY
        .get_or_init(|| {
            let config = host_config();
            let mut loader = LibraryLoader::with_search_paths(config.search_paths().to_vec());
            UtilityApi::load(&mut loader, config.utility_library(), config.release_symbol())
                .map(UtilityProxy::new)
                .map_err(|e| e.to_string())
        })
        .as_ref()
        .map_err(|e| JvmError::State(format!("utility library unavailable: {}", e)))
}

/// Failure of an entry point, mapped to a Java exception
#[derive(Debug)]
enum JvmError {
    Argument(String),
    State(String),
    Jni(jni::errors::Error),
}

impl JvmError {
    fn throw(self, env: &mut JNIEnv<'_>) {
        // a JNI failure usually already left an exception pending
        if env.exception_check().unwrap_or(false) {
            return;
        }
        let (class, message) = match self {
            JvmError::Argument(message) => (ILLEGAL_ARGUMENT, message),
            JvmError::State(message) => (ILLEGAL_STATE, message),
            JvmError::Jni(err) => (RUNTIME_EXCEPTION, err.to_string()),
        };
        if let Err(err) = env.throw_new(class, &message) {
            tracing::error!(error = %err, %message, "Could not raise Java exception");
        }
    }
}

impl From<jni::errors::Error> for JvmError {
    fn from(err: jni::errors::Error) -> Self {
        JvmError::Jni(err)
    }
}

impl From<MarshalError> for JvmError {
    fn from(err: MarshalError) -> Self {
        JvmError::Argument(err.to_string())
    }
}

impl From<LifecycleError> for JvmError {
    fn from(err: LifecycleError) -> Self {
        JvmError::State(err.to_string())
    }
}

impl From<BridgeError> for JvmError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Marshal(err) => err.into(),
            BridgeError::Lifecycle(err) => err.into(),
            other => JvmError::State(other.to_string()),
        }
    }
}

/// Run an entry point body; errors and panics become Java exceptions
fn boundary<'local, R>(
    env: &mut JNIEnv<'local>,
    fallback: R,
    body: impl FnOnce(&mut JNIEnv<'local>) -> Result<R, JvmError>,
) -> R {
    match guard::contain_panic("jni entry point", || body(env)) {
        Some(Ok(value)) => value,
        Some(Err(err)) => {
            err.throw(env);
            fallback
        }
        None => {
            JvmError::State("panic in native bridge".to_string()).throw(env);
            fallback
        }
    }
}

/// Decode the modified UTF-8 the JVM hands out
///
/// Unpaired surrogates have no UTF-8 form and are rejected instead of being
/// replaced.
fn java_text(bytes: &[u8], argument: &'static str) -> Result<String, MarshalError> {
    cesu8::from_java_cesu8(bytes)
        .map(Cow::into_owned)
        .map_err(|_| MarshalError::InvalidUtf8 { argument })
}

fn read_string(
    env: &mut JNIEnv<'_>,
    value: &JString<'_>,
    argument: &'static str,
) -> Result<String, JvmError> {
    let java = env.get_string(value)?;
    Ok(java_text(java.to_bytes(), argument)?)
}

fn required_string(
    env: &mut JNIEnv<'_>,
    value: &JString<'_>,
    argument: &'static str,
) -> Result<String, JvmError> {
    if value.is_null() {
        return Err(MarshalError::NullArgument(argument).into());
    }
    read_string(env, value, argument)
}

fn optional_string(
    env: &mut JNIEnv<'_>,
    value: &JString<'_>,
    argument: &'static str,
) -> Result<Option<String>, JvmError> {
    if value.is_null() {
        return Ok(None);
    }
    read_string(env, value, argument).map(Some)
}

/// `Integer.valueOf` takes a signed int; ids past `i32::MAX` are refused
fn boxed_token_value(token_id: u32) -> Result<jint, HostError> {
    jint::try_from(token_id).map_err(|_| {
        HostError::Allocation(format!("token id {} exceeds Integer range", token_id))
    })
}

fn handle_id(handle: jlong) -> Result<u64, JvmError> {
    u64::try_from(handle)
        .map_err(|_| JvmError::State(format!("invalid model handle {}", handle)))
}

fn to_jstring(env: &mut JNIEnv<'_>, value: Option<String>) -> Result<jstring, JvmError> {
    match value {
        Some(text) => Ok(env.new_string(text)?.into_raw()),
        None => Ok(std::ptr::null_mut()),
    }
}

impl<'local> ManagedEnv for JNIEnv<'local> {
    type Callable = JObject<'local>;
    type Pinned = GlobalRef;
    type EntryPoint = JMethodID;
    type Local = JObject<'local>;

    fn resolve_entry_point(&mut self, callable: &JObject<'local>) -> Result<JMethodID, HostError> {
        let class = self
            .get_object_class(callable)
            .map_err(|e| HostError::Unresolvable(e.to_string()))?;
        let method = self
            .get_method_id(&class, INVOKE_NAME, INVOKE_SIG)
            .map_err(|e| HostError::Unresolvable(e.to_string()));
        let _ = self.delete_local_ref(class);
        method
    }

    fn pin(&mut self, callable: &JObject<'local>) -> Result<GlobalRef, HostError> {
        self.new_global_ref(callable)
            .map_err(|e| HostError::PinFailed(e.to_string()))
    }

    fn unpin(&mut self, pinned: GlobalRef) {
        drop(pinned);
    }

    fn new_text(&mut self, text: &str) -> Result<JObject<'local>, HostError> {
        self.new_string(text)
            .map(JObject::from)
            .map_err(|e| HostError::Allocation(e.to_string()))
    }

    fn box_token_id(&mut self, token_id: u32) -> Result<JObject<'local>, HostError> {
        let value = boxed_token_value(token_id)?;
        self.call_static_method(
            "java/lang/Integer",
            "valueOf",
            "(I)Ljava/lang/Integer;",
            &[JValue::Int(value)],
        )
        .and_then(|value| value.l())
        .map_err(|e| HostError::Allocation(e.to_string()))
    }

    fn invoke(
        &mut self,
        target: &GlobalRef,
        entry: JMethodID,
        text: &JObject<'local>,
        token_id: &JObject<'local>,
    ) {
        let args = [JValue::Object(text).as_jni(), JValue::Object(token_id).as_jni()];
        // SAFETY: `entry` was resolved on this callable's class with INVOKE_SIG,
        // which takes two objects and returns an object
        let result =
            unsafe { self.call_method_unchecked(target, entry, ReturnType::Object, &args) };
        if let Ok(returned) = result.and_then(|value| value.l()) {
            // Function2 returns Unit; drop the reference right away
            let _ = self.delete_local_ref(returned);
        }
    }

    fn take_pending_fault(&mut self) -> Option<HostFault> {
        if !self.exception_check().unwrap_or(false) {
            return None;
        }
        let throwable = self.exception_occurred().ok();
        let _ = self.exception_clear();

        let description = throwable
            .and_then(|throwable| {
                let text = self
                    .call_method(&throwable, "toString", "()Ljava/lang/String;", &[])
                    .and_then(|value| value.l())
                    .ok()
                    .and_then(|obj| {
                        let jstr = JString::from(obj);
                        let text = self.get_string(&jstr).ok().map(String::from);
                        let _ = self.delete_local_ref(jstr);
                        text
                    });
                if self.exception_check().unwrap_or(false) {
                    let _ = self.exception_clear();
                }
                let _ = self.delete_local_ref(throwable);
                text
            })
            .unwrap_or_else(|| "pending Java exception".to_string());

        Some(HostFault::new(description))
    }

    fn release_local(&mut self, local: JObject<'local>) {
        let _ = self.delete_local_ref(local);
    }
}

#[no_mangle]
pub extern "system" fn Java_com_cactus_CactusLibrary_cactus_1init<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    model_path: JString<'local>,
    context_size: jint,
) -> jlong {
    boundary(&mut env, 0, |env| {
        let path = required_string(env, &model_path, "modelPath")?;
        let context_size = marshal::to_native_size("contextSize", context_size.into())?;
        let api = engine()?;

        match Model::create(api, &path, context_size) {
            Ok(model) => Ok(models().insert(model) as jlong),
            Err(BridgeError::EngineInit { .. }) => {
                tracing::warn!(model_path = %path, "Engine returned no model");
                Ok(0)
            }
            Err(err) => Err(err.into()),
        }
    })
}

#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub extern "system" fn Java_com_cactus_CactusLibrary_cactus_1complete<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    model: jlong,
    messages_json: JString<'local>,
    response_buffer: JByteArray<'local>,
    buffer_size: jint,
    options_json: JString<'local>,
    tools_json: JString<'local>,
    callback: JObject<'local>,
) -> jint {
    boundary(&mut env, -1, |env| {
        let id = handle_id(model)?;
        let messages = required_string(env, &messages_json, "messagesJson")?;
        let options = optional_string(env, &options_json, "optionsJson")?;
        let tools = optional_string(env, &tools_json, "toolsJson")?;
        if response_buffer.is_null() {
            return Err(MarshalError::NullArgument("responseBuffer").into());
        }

        // CopyBack commits the engine's writes when `elements` drops
        let mut elements =
            unsafe { env.get_array_elements(&response_buffer, ReleaseMode::CopyBack) }?;
        let bytes: &mut [i8] = &mut elements;
        // SAFETY: i8 and u8 share layout; the slice borrows `elements`
        let region =
            unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr().cast::<u8>(), bytes.len()) };
        let mut buffer = ResponseBuffer::with_declared(region, buffer_size.into())?;

        let request = CompletionRequest {
            messages: &messages,
            options: options.as_deref(),
            tools: tools.as_deref(),
        };
        let callable = (!callback.is_null()).then_some(&callback);

        let outcome = models().with_model(id, |model| {
            let callback = TokenCallback::bind(&mut *env, callable);
            model.complete_streaming(&request, &mut buffer, callback)
        })??;

        drop(elements);
        Ok(outcome.status.code())
    })
}

#[no_mangle]
pub extern "system" fn Java_com_cactus_CactusLibrary_cactus_1destroy<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    model: jlong,
) {
    boundary(&mut env, (), |_env| {
        models().destroy(handle_id(model)?)?;
        Ok(())
    })
}

#[no_mangle]
pub extern "system" fn Java_com_cactus_utils_DeviceInfo_1androidKt_nativeRegisterApp<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    encrypted_payload: JString<'local>,
) -> jstring {
    boundary(&mut env, std::ptr::null_mut(), |env| {
        let payload = required_string(env, &encrypted_payload, "encryptedPayload")?;
        let result = utility()?.register_app(&payload)?;
        to_jstring(env, result)
    })
}

#[no_mangle]
pub extern "system" fn Java_com_cactus_utils_DeviceInfo_1androidKt_nativeGetDeviceId<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
) -> jstring {
    boundary(&mut env, std::ptr::null_mut(), |env| {
        let result = utility()?.get_device_id();
        to_jstring(env, result)
    })
}

#[no_mangle]
pub extern "system" fn Java_com_cactus_utils_DeviceInfo_1androidKt_nativeSetAndroidDataDirectory<
    'local,
>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    data_directory: JString<'local>,
) {
    boundary(&mut env, (), |env| {
        let path = required_string(env, &data_directory, "dataDirectory")?;
        utility()?.set_data_directory(Path::new(&path))?;
        Ok(())
    })
}
