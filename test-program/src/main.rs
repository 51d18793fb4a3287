use std::{ffi::c_void, hint::black_box};

use stepwind::{
    dwarf::divination::DlFindObject,
    native::_Unwind_Backtrace,
    uw::{self, _Unwind_Context, _Unwind_Reason_Code},
    Cursor, LocalAddressSpace, StepResult,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() {
    let registry = tracing_subscriber::Registry::default().with(
        EnvFilter::builder()
            .with_default_directive(tracing::Level::TRACE.into())
            .from_env()
            .unwrap(),
    );

    let tree_layer = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    registry.with(tree_layer).init();

    nested(3);
}

#[inline(never)]
fn nested(depth: u32) {
    if depth > 0 {
        nested(black_box(depth - 1));
    } else {
        walk();
        backtrace();
    }
    black_box(depth);
}

#[inline(never)]
fn walk() {
    println!("-- cursor --");
    let mut cursor = Cursor::new(
        LocalAddressSpace::validated(),
        DlFindObject,
        stepwind::current_registers(),
    );
    for frame in 0.. {
        let ip = cursor.registers().ip();
        match cursor.proc_info() {
            Ok(Some(info)) => println!(
                "#{frame} {ip:#x} in {:#x}..{:#x} lsda={:x?} personality={:x?} args_size={}",
                info.start_ip, info.end_ip, info.lsda, info.personality, info.args_size
            ),
            Ok(None) => println!("#{frame} {ip:#x} without unwind info"),
            Err(err) => {
                println!("#{frame} {ip:#x}: {err}");
                break;
            }
        }
        match cursor.step() {
            Ok(StepResult::Stepped) => {}
            Ok(StepResult::EndOfStack) => {
                println!("end of stack");
                break;
            }
            Err(err) => {
                println!("step failed: {err} ({:?})", err.failure());
                break;
            }
        }
    }
}

unsafe extern "C" fn print_frame(
    context: *mut _Unwind_Context,
    argument: *mut c_void,
) -> _Unwind_Reason_Code {
    let frames = unsafe { &mut *argument.cast::<usize>() };
    let (ip, start, cfa) = unsafe {
        (
            uw::_Unwind_GetIP(context),
            uw::_Unwind_GetRegionStart(context),
            uw::_Unwind_GetCFA(context),
        )
    };
    println!("#{frames} {ip:#x} in {start:#x} cfa={cfa:#x}");
    *frames += 1;
    _Unwind_Reason_Code::_URC_NO_REASON
}

#[inline(never)]
fn backtrace() {
    println!("-- _Unwind_Backtrace --");
    let mut frames = 0usize;
    let reason = unsafe { _Unwind_Backtrace(print_frame, (&mut frames as *mut usize).cast()) };
    println!("{frames} frames, {reason:?}");
}
