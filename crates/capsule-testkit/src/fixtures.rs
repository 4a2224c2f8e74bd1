//! Capsule definitions used across the integration tests.

use capsule_kernel::{CodeDefinition, Ctx, Gate, KernelError, Value};

fn nat_arg(args: &[Value], index: usize) -> Result<u64, KernelError> {
    match args.get(index) {
        None | Some(Value::Null) => Ok(0),
        Some(v) => v
            .as_nat()
            .ok_or_else(|| KernelError::user(format!("expected a number, got {}", v.kind()))),
    }
}

fn count(ctx: &mut Ctx<'_>) -> Result<u64, KernelError> {
    Ok(ctx.field("count")?.as_nat().unwrap_or(0))
}

/// `count` plus a private `_secret` that only Counter code may touch.
pub fn counter() -> CodeDefinition {
    CodeDefinition::new("Counter", "class Counter { count; _secret }")
        .method("init", |ctx, args| {
            let start = nat_arg(args, 0)?;
            ctx.set_field("count", start)?;
            ctx.set_field("_secret", "hidden")?;
            Ok(Value::Null)
        })
        .method("inc", |ctx, _| {
            let next = count(ctx)? + 1;
            ctx.set_field("count", next)?;
            Ok(Value::Nat(next))
        })
        .method("add", |ctx, args| {
            let next = count(ctx)? + nat_arg(args, 0)?;
            ctx.set_field("count", next)?;
            Ok(Value::Nat(next))
        })
        .method("get", |ctx, _| ctx.field("count"))
        .method("rewrite", |ctx, _| {
            let current = ctx.field("count")?;
            ctx.set_field("count", current)?;
            Ok(Value::Null)
        })
        .method("fail_after_write", |ctx, _| {
            ctx.set_field("count", 999u64)?;
            Err(KernelError::user("refusing to finish"))
        })
        .method("reset", |ctx, _| {
            let this = ctx.this()?;
            ctx.call(this, "_zero", Vec::new())
        })
        .method("_zero", |ctx, _| {
            ctx.set_field("count", 0u64)?;
            Ok(Value::Null)
        })
        .method("reveal", |ctx, args| {
            let other = args
                .first()
                .and_then(Value::as_capsule)
                .ok_or_else(|| KernelError::user("reveal needs a counter"))?;
            ctx.get(other, "_secret")
        })
        .method("claim", |ctx, args| {
            ctx.auth()?;
            let owner = args.first().cloned().unwrap_or_default();
            ctx.set_field("owner", owner)?;
            Ok(Value::Null)
        })
        .method("burn", |ctx, _| {
            ctx.destroy()?;
            Ok(Value::Null)
        })
        .method("set_units", |ctx, args| {
            ctx.set_field("units", nat_arg(args, 0)?)?;
            Ok(Value::Null)
        })
}

/// Holds a reference to another capsule and reaches through it.
pub fn holder() -> CodeDefinition {
    CodeDefinition::new("Holder", "class Holder { item }")
        .method("init", |ctx, args| {
            ctx.set_field("item", args.first().cloned().unwrap_or_default())?;
            Ok(Value::Null)
        })
        .method("swap", |ctx, args| {
            ctx.set_field("item", args.first().cloned().unwrap_or_default())?;
            Ok(Value::Null)
        })
        .method("bump", |ctx, _| {
            let item = item_of(ctx)?;
            ctx.call(item, "inc", Vec::new())
        })
        .method("peek", |ctx, _| {
            let item = item_of(ctx)?;
            let seen = ctx.get(item, "count")?;
            ctx.set_field("seen", seen.clone())?;
            Ok(seen)
        })
        .method("look", |ctx, _| {
            let item = item_of(ctx)?;
            ctx.get(item, "count")
        })
        .method("poke", |ctx, _| {
            let item = item_of(ctx)?;
            ctx.set(item, "count", Value::Nat(42))?;
            Ok(Value::Null)
        })
        .method("peek_secret", |ctx, _| {
            let item = item_of(ctx)?;
            ctx.get(item, "_secret")
        })
        .method("swallow", |ctx, _| {
            let item = item_of(ctx)?;
            let _ = ctx.call(item, "fail_after_write", Vec::new());
            Ok(Value::Null)
        })
        .method("overwrite_identity", |ctx, _| {
            ctx.set_field("identity", "forged")?;
            Ok(Value::Null)
        })
}

fn item_of(ctx: &mut Ctx<'_>) -> Result<capsule_kernel::CapsuleId, KernelError> {
    ctx.field("item")?
        .as_capsule()
        .ok_or_else(|| KernelError::user("holder is empty"))
}

/// Creates counters through a dependency binding.
pub fn factory() -> CodeDefinition {
    CodeDefinition::new("Factory", "class Factory { made }")
        .method("init", |ctx, _| {
            ctx.set_field("made", Value::List(Vec::new()))?;
            Ok(Value::Null)
        })
        .method("make", |ctx, args| {
            let code = ctx.dep("counter")?;
            let made = ctx.create(code, args.to_vec())?;
            let mut list = match ctx.field("made")? {
                Value::List(items) => items,
                _ => Vec::new(),
            };
            list.push(Value::Capsule(made));
            ctx.set_field("made", Value::List(list))?;
            Ok(Value::Capsule(made))
        })
}

/// A Counter subtype; shares Counter's private members.
pub fn special_counter() -> CodeDefinition {
    CodeDefinition::new("SpecialCounter", "class SpecialCounter extends Counter {}")
        .method("peek_own_secret", |ctx, _| ctx.field("_secret"))
        .method("double", |ctx, _| {
            let next = count(ctx)? * 2;
            ctx.set_field("count", next)?;
            Ok(Value::Nat(next))
        })
}
