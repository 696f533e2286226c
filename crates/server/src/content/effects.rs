use std::any::Any;
use std::time::Duration;

use mud_engine::{
    DefinitionError, DefinitionWriter, Effect, EffectContext, EffectCore, EffectDefinition,
    EntityKey, LoadContext, PerceptionTypes,
};

pub(crate) const STAT_MODIFIER: &str = "StatModifier";
pub(crate) const CONCEALED: &str = "Concealed";
pub(crate) const POISONED: &str = "Poisoned";
pub(crate) const WEAKENED: &str = "Weakened";
pub(crate) const TETHERED: &str = "Tethered";

pub(crate) const HEALTH: &str = "health";
pub(crate) const STRENGTH: &str = "strength";
pub(crate) const WEAKENED_DURATION: Duration = Duration::from_secs(60);

type Loaded = Result<Option<Box<dyn Effect>>, DefinitionError>;

/// Flat bonus (or penalty) to one attribute for as long as the effect lasts.
#[derive(Debug)]
pub(crate) struct StatModifier {
    core: EffectCore,
    pub(crate) attribute: String,
    pub(crate) amount: i64,
}

impl StatModifier {
    pub(crate) fn new(core: EffectCore, attribute: impl Into<String>, amount: i64) -> Self {
        Self {
            core,
            attribute: attribute.into(),
            amount,
        }
    }
}

impl Effect for StatModifier {
    fn core(&self) -> &EffectCore {
        &self.core
    }

    fn specific_type(&self) -> &'static str {
        STAT_MODIFIER
    }

    fn saving_effect(&self) -> bool {
        true
    }

    fn initial_effect(&mut self, cx: &mut EffectContext<'_>) {
        cx.adjust_owner_attribute(&self.attribute, self.amount);
    }

    fn removal_effect(&mut self, cx: &mut EffectContext<'_>) {
        cx.adjust_owner_attribute(&self.attribute, -self.amount);
    }

    fn save_definition(&self, writer: &mut DefinitionWriter<'_>) -> bool {
        writer
            .field("Attribute", &self.attribute)
            .field("Amount", self.amount);
        true
    }

    fn describe(&self) -> String {
        format!("{} {:+} {}", STAT_MODIFIER, self.amount, self.attribute)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(crate) fn load_stat_modifier(definition: &EffectDefinition, ctx: &LoadContext<'_>) -> Loaded {
    Ok(Some(Box::new(StatModifier::new(
        EffectCore::new(ctx.id, ctx.owner),
        definition.required("Attribute")?,
        definition.parse_field("Amount")?,
    ))))
}

#[derive(Debug)]
pub(crate) struct Concealed {
    core: EffectCore,
}

impl Concealed {
    pub(crate) fn new(core: EffectCore) -> Self {
        Self { core }
    }
}

impl Effect for Concealed {
    fn core(&self) -> &EffectCore {
        &self.core
    }

    fn specific_type(&self) -> &'static str {
        CONCEALED
    }

    fn saving_effect(&self) -> bool {
        true
    }

    fn applies_to(&self, perceiver: EntityKey) -> bool {
        perceiver != self.owner()
    }

    fn hides(&self) -> PerceptionTypes {
        PerceptionTypes::VISUAL
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(crate) fn load_concealed(_definition: &EffectDefinition, ctx: &LoadContext<'_>) -> Loaded {
    Ok(Some(Box::new(Concealed::new(EffectCore::new(
        ctx.id, ctx.owner,
    )))))
}

/// Deals its damage once on arrival. Running its course leaves the victim
/// weakened; curing it early does not.
#[derive(Debug)]
pub(crate) struct Poisoned {
    core: EffectCore,
    pub(crate) damage: i64,
}

impl Poisoned {
    pub(crate) fn new(core: EffectCore, damage: i64) -> Self {
        Self { core, damage }
    }

    fn aftermath_penalty(&self) -> i64 {
        (self.damage / 2).max(1)
    }
}

impl Effect for Poisoned {
    fn core(&self) -> &EffectCore {
        &self.core
    }

    fn specific_type(&self) -> &'static str {
        POISONED
    }

    fn saving_effect(&self) -> bool {
        true
    }

    fn initial_effect(&mut self, cx: &mut EffectContext<'_>) {
        cx.adjust_owner_attribute(HEALTH, -self.damage);
    }

    fn expire_effect(&mut self, cx: &mut EffectContext<'_>) {
        let owner = cx.owner_key();
        let weakened = Weakened::new(cx.new_core(owner), self.aftermath_penalty());
        cx.queue_add(owner, Box::new(weakened), Some(WEAKENED_DURATION));
    }

    fn save_definition(&self, writer: &mut DefinitionWriter<'_>) -> bool {
        writer.field("Damage", self.damage);
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(crate) fn load_poisoned(definition: &EffectDefinition, ctx: &LoadContext<'_>) -> Loaded {
    Ok(Some(Box::new(Poisoned::new(
        EffectCore::new(ctx.id, ctx.owner),
        definition.parse_field("Damage")?,
    ))))
}

#[derive(Debug)]
pub(crate) struct Weakened {
    core: EffectCore,
    pub(crate) penalty: i64,
}

impl Weakened {
    pub(crate) fn new(core: EffectCore, penalty: i64) -> Self {
        Self { core, penalty }
    }
}

impl Effect for Weakened {
    fn core(&self) -> &EffectCore {
        &self.core
    }

    fn specific_type(&self) -> &'static str {
        WEAKENED
    }

    fn saving_effect(&self) -> bool {
        true
    }

    fn initial_effect(&mut self, cx: &mut EffectContext<'_>) {
        cx.adjust_owner_attribute(STRENGTH, -self.penalty);
    }

    fn removal_effect(&mut self, cx: &mut EffectContext<'_>) {
        cx.adjust_owner_attribute(STRENGTH, self.penalty);
    }

    fn save_definition(&self, writer: &mut DefinitionWriter<'_>) -> bool {
        writer.field("Penalty", self.penalty);
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(crate) fn load_weakened(definition: &EffectDefinition, ctx: &LoadContext<'_>) -> Loaded {
    Ok(Some(Box::new(Weakened::new(
        EffectCore::new(ctx.id, ctx.owner),
        definition.parse_field("Penalty")?,
    ))))
}

/// Binds the owner to another entity, saved by that entity's durable id.
#[derive(Debug)]
pub(crate) struct Tethered {
    core: EffectCore,
    pub(crate) anchor: EntityKey,
}

impl Tethered {
    pub(crate) fn new(core: EffectCore, anchor: EntityKey) -> Self {
        Self { core, anchor }
    }
}

impl Effect for Tethered {
    fn core(&self) -> &EffectCore {
        &self.core
    }

    fn specific_type(&self) -> &'static str {
        TETHERED
    }

    fn saving_effect(&self) -> bool {
        true
    }

    fn save_definition(&self, writer: &mut DefinitionWriter<'_>) -> bool {
        writer.entity_ref("Anchor", self.anchor)
    }

    fn describe(&self) -> String {
        format!("{} to {}", TETHERED, self.anchor)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(crate) fn load_tethered(definition: &EffectDefinition, ctx: &LoadContext<'_>) -> Loaded {
    let Some(anchor) = ctx.entity(definition.db_id_field("Anchor")?) else {
        return Ok(None);
    };
    Ok(Some(Box::new(Tethered::new(
        EffectCore::new(ctx.id, ctx.owner),
        anchor,
    ))))
}
