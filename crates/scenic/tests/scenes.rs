//! End-to-end scene parses covering the language's observable behavior:
//! declarations, expression evaluation, macros, loops, and the scene graph
//! the builders produce.

use pretty_assertions::assert_eq;
use scenic::{
    CollectMessages, ErrorKind, MemoryStreams, ParseError, ParserOptions, SceneData, Shape, parse_scene,
};

fn parse(source: &str) -> (SceneData, CollectMessages) {
    let mut env = MemoryStreams::new();
    let mut messages = CollectMessages::new();
    let scene = parse_scene("test.pov", source, &mut env, &mut messages, ParserOptions::default())
        .unwrap_or_else(|e| panic!("scene failed to parse: {e}"));
    (scene, messages)
}

fn parse_err(source: &str) -> ParseError {
    let mut env = MemoryStreams::new();
    let mut messages = CollectMessages::new();
    parse_scene("test.pov", source, &mut env, &mut messages, ParserOptions::default())
        .err()
        .expect("scene should fail to parse")
}

/// Parses and returns what `#debug` wrote, the test suite's window into
/// symbol values.
fn debug_output(source: &str) -> String {
    let (_, messages) = parse(source);
    messages.debug_output().to_owned()
}

#[test]
fn test_declare_scalar_arithmetic() {
    let out = debug_output("#declare x = 2 + 3 * 4;\n#debug str(x, 0, -1)");
    assert_eq!(out, "14.0\n");
}

#[test]
fn test_vector_member_sum() {
    let out = debug_output(
        "#declare v = <1, 2, 3>; #declare s = v.x + v.y + v.z;\n#debug str(s, 0, -1)",
    );
    assert_eq!(out, "6.0\n");
}

#[test]
fn test_color_addition() {
    let out = debug_output(
        "#declare c = rgb <1,0,0> + rgb <0,1,0>;\n\
         #debug concat(str(c.red,0,-1), \" \", str(c.green,0,-1), \" \", str(c.blue,0,-1))",
    );
    assert_eq!(out, "1.0 1.0 0.0\n");
}

#[test]
fn test_macro_expansion_in_expression() {
    let out = debug_output("#macro add(a, b) a + b #end\n#declare r = add(10, 20);\n#debug str(r, 0, -1)");
    assert_eq!(out, "30.0\n");
}

#[test]
fn test_for_loop_accumulates() {
    let out = debug_output(
        "#declare s = 0;\n#for(i, 1, 5)\n  #declare s = s + i;\n#end\n#debug str(s, 0, -1)",
    );
    assert_eq!(out, "15.0\n");
}

#[test]
fn test_single_sphere_scene() {
    let (scene, _) = parse("sphere { <0,0,0>, 1 }");
    assert_eq!(scene.objects().len(), 1);
    match &scene.objects()[0].shape {
        Shape::Sphere { center, radius } => {
            assert_eq!(*center, [0.0, 0.0, 0.0]);
            assert_eq!(*radius, 1.0);
        }
        other => panic!("expected a sphere, found {}", other.name()),
    }
}

#[test]
fn test_unterminated_comment_is_lex_error() {
    let err = parse_err("sphere { <0,0,0>, 1 } /* no end");
    assert_eq!(err.kind, ErrorKind::Lex);
    // position points at the opening of the comment
    assert_eq!(err.position.unwrap().column, 23);
}

#[test]
fn test_self_reference_of_undefined_is_symbol_error() {
    let err = parse_err("#declare x = x;");
    assert_eq!(err.kind, ErrorKind::Symbol);
    assert!(err.message.contains('x'));
}

#[test]
fn test_scalar_broadcasts_over_vector() {
    let out = debug_output(
        "#declare r = 2 + <1, 2, 3>;\n\
         #debug concat(str(r.x,0,-1), \" \", str(r.y,0,-1), \" \", str(r.z,0,-1))\n\
         #declare p = 2 * <1, 2, 3>;\n\
         #debug str(p.z, 0, -1)\n\
         #declare q = <8, 6, 4> / 2;\n\
         #debug str(q.x, 0, -1)",
    );
    assert_eq!(out, "3.0 4.0 5.0\n6.0\n4.0\n");
}

#[test]
fn test_copy_semantics_not_aliasing() {
    // b copies a; later redefinition of a leaves b untouched
    let out = debug_output(
        "#declare a = <1, 2, 3>;\n#declare b = a;\n#declare a = <9, 9, 9>;\n#debug str(b.x, 0, -1)",
    );
    assert_eq!(out, "1.0\n");
}

#[test]
fn test_macro_parameter_is_reference() {
    // a bare identifier argument passes by reference: assignment inside
    // the macro mutates the caller's variable
    let out = debug_output(
        "#macro bump(v) #declare v = v + 1; #end\n\
         #declare counter = 5;\n\
         bump(counter)\n\
         #debug str(counter, 0, -1)",
    );
    assert_eq!(out, "6.0\n");
}

#[test]
fn test_local_scoping_ends_with_macro() {
    let out = debug_output(
        "#macro scoped() #local hidden = 5; #end\n\
         scoped()\n\
         #if (defined(hidden)) #debug \"visible\" #else #debug \"gone\" #end",
    );
    assert_eq!(out, "gone\n");
}

#[test]
fn test_declare_persists_until_undef() {
    let out = debug_output(
        "#declare kept = 1;\n\
         #if (defined(kept)) #debug \"yes\" #end\n\
         #undef kept\n\
         #if (defined(kept)) #debug \"still\" #else #debug \"undefined\" #end",
    );
    assert_eq!(out, "yes\nundefined\n");
}

#[test]
fn test_macro_too_few_parameters() {
    let err = parse_err("#macro two(a, b) a + b #end\n#declare r = two(1);");
    assert_eq!(err.kind, ErrorKind::Parse);
    assert!(err.message.contains("too few") || err.message.contains("not optional"));
}

#[test]
fn test_macro_too_many_parameters() {
    let err = parse_err("#macro one(a) a #end\n#declare r = one(1, 2);");
    assert_eq!(err.kind, ErrorKind::Parse);
    assert!(err.message.contains("too many"));
}

#[test]
fn test_macro_optional_parameter_defaults_undefined() {
    let out = debug_output(
        "#macro opt(a, optional b)\n\
           #if (defined(b)) #debug \"has b\" #else #debug \"no b\" #end\n\
         #end\n\
         opt(1)\n\
         opt(1, 2)",
    );
    assert_eq!(out, "no b\nhas b\n");
}

#[test]
fn test_prototype_override_idiom() {
    let (scene, _) = parse(
        "#declare Ball = sphere { <0,0,0>, 2 };\n\
         object { Ball translate <5, 0, 0> }",
    );
    assert_eq!(scene.objects().len(), 1);
    let node = &scene.objects()[0];
    assert!(matches!(node.shape, Shape::Sphere { radius, .. } if radius == 2.0));
    // the translation landed in the composed transform
    assert_eq!(node.transform.apply([0.0, 0.0, 0.0]), [5.0, 0.0, 0.0]);
}

#[test]
fn test_csg_difference_needs_two_children() {
    let err = parse_err("difference { sphere { <0,0,0>, 1 } }");
    assert_eq!(err.kind, ErrorKind::Parse);
}

#[test]
fn test_csg_collects_children() {
    let (scene, _) = parse(
        "union {\n\
           sphere { <0,0,0>, 1 }\n\
           box { <-1,-1,-1>, <1,1,1> }\n\
           cylinder { <0,-1,0>, <0,1,0>, 0.5 }\n\
         }",
    );
    assert_eq!(scene.objects().len(), 1);
    match &scene.objects()[0].shape {
        Shape::Csg { children, .. } => assert_eq!(children.len(), 3),
        other => panic!("expected CSG, found {}", other.name()),
    }
}

#[test]
fn test_negative_sphere_radius_rejected() {
    let err = parse_err("sphere { <0,0,0>, -1 }");
    assert_eq!(err.kind, ErrorKind::Domain);
}

#[test]
fn test_camera_light_background() {
    let (scene, _) = parse(
        "camera { location <0, 1, -5> look_at <0, 0, 0> }\n\
         light_source { <10, 10, -10>, rgb <1, 1, 1> }\n\
         background { rgb <0.2, 0.3, 0.4> }",
    );
    let camera = scene.camera().expect("camera was set");
    assert_eq!(camera.location, [0.0, 1.0, -5.0]);
    assert_eq!(scene.lights().len(), 1);
    let background = scene.background().expect("background was set");
    assert_eq!(background.red, 0.2);
    // the canonical default makes an unfiltered background transmit
    assert_eq!(background.transmit, 1.0);
}

#[test]
fn test_second_camera_warns_and_wins() {
    let (scene, messages) = parse(
        "camera { location <0, 0, -1> }\n\
         camera { location <0, 0, -9> }",
    );
    assert!(messages.contains("more than one camera"));
    assert_eq!(scene.camera().unwrap().location, [0.0, 0.0, -9.0]);
}

#[test]
fn test_missing_brace_points_at_opener() {
    let err = parse_err("sphere { <0,0,0>, 1");
    assert_eq!(err.kind, ErrorKind::Parse);
}

#[test]
fn test_textured_sphere() {
    let (scene, _) = parse(
        "sphere { <0,0,0>, 1\n\
           texture {\n\
             pigment { rgb <1, 0, 0> }\n\
             finish { phong 0.9 ambient 0.1 }\n\
           }\n\
         }",
    );
    let node = &scene.objects()[0];
    assert_eq!(node.textures.len(), 1);
}

#[test]
fn test_layering_patterned_texture_fails() {
    let err = parse_err(
        "sphere { <0,0,0>, 1\n\
           texture { checker texture_map { [0 pigment { rgb 1 }] [1 pigment { rgb 0 }] } }\n\
           texture { pigment { rgb <1,0,0> } }\n\
         }",
    );
    assert_eq!(err.kind, ErrorKind::Parse);
    assert!(err.message.contains("layer"));
}

#[test]
fn test_global_settings_and_gamma_warning() {
    let (scene, messages) = parse("global_settings { assumed_gamma 1.0 max_trace_level 10 }");
    assert_eq!(scene.global_settings().assumed_gamma, Some(1.0));
    assert_eq!(scene.global_settings().max_trace_level, 10);
    assert!(!messages.contains("assumed_gamma"));

    let (_, messages) = parse("sphere { <0,0,0>, 1 }");
    assert!(messages.contains("assumed_gamma"));
}

#[test]
fn test_isosurface_with_compiled_function() {
    let (scene, _) = parse(
        "isosurface {\n\
           function { x*x + y*y + z*z - 1 }\n\
           contained_by { box { <-2,-2,-2>, <2,2,2> } }\n\
           max_gradient 4\n\
         }",
    );
    let Shape::Isosurface { function, max_gradient, .. } = &scene.objects()[0].shape else {
        panic!("expected an isosurface");
    };
    assert_eq!(*max_gradient, 4.0);
    // the compiled field evaluates like the source expression
    let mut context = scenic::VmContext::new();
    let at_surface = context
        .run_scalar(scene.functions(), *function, &[1.0, 0.0, 0.0])
        .unwrap();
    assert!(at_surface.abs() < 1e-12);
}

#[test]
fn test_user_error_directive() {
    let err = parse_err("#error \"deliberate failure\"");
    assert!(err.message.contains("deliberate failure"));
}

#[test]
fn test_experimental_feature_summary() {
    let (_, messages) = parse(
        "#declare path = spline { linear_spline 0, <0,0,0> 1, <1,2,3> };\n\
         #declare p = path(0.5);\n\
         #debug str(p.y, 0, -1)",
    );
    assert_eq!(messages.debug_output(), "1.0\n");
    assert!(messages.contains("experimental"));
}

#[test]
fn test_string_functions() {
    let out = debug_output(
        "#declare s = concat(\"ab\", strupr(\"cd\"), strlwr(\"EF\"));\n\
         #debug s\n\
         #debug str(strlen(s), 0, -1)\n\
         #debug substr(s, 3, 2)\n\
         #debug chr(asc(\"Q\"))",
    );
    assert_eq!(out, "abCDef\n6.0\nCD\nQ\n");
}

#[test]
fn test_declared_color_map_stands_in() {
    let (scene, _) = parse(
        "#declare Fire = color_map { [0 rgb <1,0,0>] [1 rgb <1,1,0>] };\n\
         sphere { <0,0,0>, 1 pigment { gradient y color_map { Fire } } }",
    );
    let node = &scene.objects()[0];
    let scenic::TextureKind::Plain { pigment, .. } = &node.textures[0].kind else {
        panic!("expected a plain texture");
    };
    let scenic::PigmentKind::Pattern { blend, .. } = &pigment.kind else {
        panic!("expected a patterned pigment");
    };
    let scenic::PigmentBlend::Colors(map) = blend else {
        panic!("expected a color map");
    };
    assert_eq!(map.len(), 2);
}

#[test]
fn test_seeded_random_is_deterministic() {
    let first = debug_output(
        "#declare r = seed(42);\n#debug str(rand(r), 0, 6)\n#debug str(rand(r), 0, 6)",
    );
    let second = debug_output(
        "#declare r = seed(42);\n#debug str(rand(r), 0, 6)\n#debug str(rand(r), 0, 6)",
    );
    assert_eq!(first, second);
    let lines: Vec<&str> = first.lines().collect();
    assert_ne!(lines[0], lines[1], "successive draws differ");
}
